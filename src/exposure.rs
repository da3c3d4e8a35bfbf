use crate::types::Pose;
use nalgebra::Vector3;

/// Maximum number of constellation cameras.
pub const MAX_SENSORS: usize = 4;
/// Maximum number of tracked devices (HMD plus two controllers).
pub const MAX_TRACKED_DEVICES: usize = 3;

/// Per-device snapshot taken when an exposure event arrives.
#[derive(Debug, Clone, Copy)]
pub struct DeviceExposureInfo {
    /// Extended device clock at the exposure instant.
    pub device_time_ns: u64,
    /// Delay slot allocated for this exposure, or -1 if none was available.
    pub fusion_slot: i32,
    /// Whether the device had a recent positional observation at the time.
    pub had_pose_lock: bool,
    /// Predicted model-frame pose at the exposure instant.
    pub capture_pose: Pose,
    /// Positional uncertainty of `capture_pose` (std-dev per axis, model frame).
    pub pos_error: Vector3<f32>,
    /// Rotational uncertainty of `capture_pose` (std-dev per axis, model frame).
    pub rot_error: Vector3<f32>,
}

impl Default for DeviceExposureInfo {
    fn default() -> DeviceExposureInfo {
        DeviceExposureInfo {
            device_time_ns: 0,
            fusion_slot: -1,
            had_pose_lock: false,
            capture_pose: Pose::identity(),
            pos_error: Vector3::zeros(),
            rot_error: Vector3::zeros(),
        }
    }
}

/// Tracker-wide record of the most recent camera exposure event.
///
/// Published under the tracker lock and snapshotted by value, so sensor
/// threads can react without holding any tracker state.
#[derive(Debug, Clone, Copy)]
pub struct ExposureInfo {
    /// Host time the exposure event was observed, nanoseconds.
    pub local_ts: u64,
    /// HMD clock at the exposure, microseconds (raw 32-bit).
    pub hmd_ts: u32,
    /// Monotonic exposure counter reported by the HMD.
    pub count: u16,
    /// LED blink-pattern phase during this exposure.
    pub led_pattern_phase: u8,
    /// Number of valid entries in `devices`.
    pub n_devices: usize,
    pub devices: [DeviceExposureInfo; MAX_TRACKED_DEVICES],
}

impl Default for ExposureInfo {
    fn default() -> ExposureInfo {
        ExposureInfo {
            local_ts: 0,
            hmd_ts: 0,
            count: 0,
            led_pattern_phase: 0,
            n_devices: 0,
            devices: [DeviceExposureInfo::default(); MAX_TRACKED_DEVICES],
        }
    }
}
