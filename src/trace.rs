use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

/// Directory to write per-device JSON trace files into. Tracing is off
/// when the variable is unset.
const TRACE_DIR_ENV: &str = "RIFT_TRACE_DIR";

/// JSON-lines trace sink for one tracked device.
///
/// Records IMU observations, exposure events, and pose updates for
/// offline analysis of filter behavior. Each line is a self-contained
/// JSON object with a `type` field.
pub struct DeviceTrace {
    out: Option<BufWriter<File>>,
}

impl DeviceTrace {
    pub fn new(device_name: &str) -> DeviceTrace {
        let out = std::env::var(TRACE_DIR_ENV).ok().and_then(|dir| {
            let mut path = PathBuf::from(dir);
            path.push(device_name);
            match File::create(&path) {
                Ok(f) => {
                    log::info!("Opening trace file {}", path.display());
                    Some(BufWriter::new(f))
                }
                Err(e) => {
                    log::warn!("Failed to open trace file {}: {}", path.display(), e);
                    None
                }
            }
        });

        DeviceTrace { out }
    }

    /// A sink that never writes, for tests.
    pub fn disabled() -> DeviceTrace {
        DeviceTrace { out: None }
    }

    pub fn enabled(&self) -> bool {
        self.out.is_some()
    }

    /// Write one JSON line. Lines are flushed immediately so traces
    /// survive a crash of the host process.
    pub fn push(&mut self, line: &str) {
        if let Some(out) = self.out.as_mut() {
            let _ = writeln!(out, "{}", line);
            let _ = out.flush();
        }
    }
}

impl std::fmt::Debug for DeviceTrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceTrace")
            .field("enabled", &self.enabled())
            .finish()
    }
}
