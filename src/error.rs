/// Errors that can occur while setting up or running the tracker.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("Unsupported sensor (VID=2833 PID={0:04x})")]
    UnknownSensor(u16),

    #[error("UVC negotiation failed: {0}")]
    Negotiation(&'static str),

    #[error("Short control response: got {got} bytes, expected {expected}")]
    ShortControlResponse { got: usize, expected: usize },

    #[error("Failed to allocate isochronous transfer")]
    TransferAlloc,

    #[error("Video stream is already running")]
    StreamRunning,

    #[error("Video stream is not running")]
    StreamNotRunning,

    #[error("Tracked device table is full")]
    TooManyDevices,

    #[error("Failed to spawn thread: {0}")]
    Thread(#[from] std::io::Error),
}
