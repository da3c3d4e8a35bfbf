//! # rift-tracker - Positional tracking core for Oculus Rift constellation sensors
//!
//! Fuses inertial measurements from the headset and controllers with
//! optical observations from the infrared tracking cameras into a
//! continuous 6-DoF pose per device. Provides:
//! - UVC isochronous video streaming from DK2 and CV1 sensors (rusb/libusb)
//! - Exposure-synchronized delay slots that let late visual observations
//!   retroactively correct the running fusion filter
//! - Smoothed view poses with tracking-loss handling
//!
//! The vision pipeline (blob detection, constellation search, PnP) and
//! the Kalman filter itself live behind the [`TrackerSensor`] and
//! [`FusionFilter`] seams.
//!
//! ## Quick Start
//! ```no_run
//! use rift_tracker::{Tracker, TrackerConfig, Pose};
//!
//! let tracker = Tracker::new(TrackerConfig::default()).unwrap();
//! let streams = tracker.open_sensor_streams().unwrap();
//! println!("found {} cameras", streams.len());
//!
//! # let hmd_filter: Box<dyn rift_tracker::FusionFilter> = unimplemented!();
//! let hmd = tracker
//!     .add_device(0, &Pose::identity(), &Pose::identity(), Vec::new(), hmd_filter)
//!     .unwrap();
//!
//! // HID loop: hmd.imu_update(...) / tracker.on_new_exposure(...)
//! // Application: hmd.get_view_pose()
//! ```

pub mod device;
pub mod error;
pub mod exp_filter;
pub mod exposure;
pub mod frame;
pub mod fusion;
pub mod profile;
pub mod stream;
pub mod trace;
pub mod tracker;
pub mod types;
pub mod uvc;

pub use device::{TrackedDevice, ViewPose, NUM_POSE_DELAY_SLOTS};
pub use error::TrackerError;
pub use exposure::{DeviceExposureInfo, ExposureInfo, MAX_SENSORS, MAX_TRACKED_DEVICES};
pub use frame::{FramePool, VideoFrame};
pub use fusion::{FilterState, FusionFilter};
pub use profile::SensorVariant;
pub use stream::{FrameSink, UvcStream};
pub use tracker::{Tracker, TrackerConfig, TrackerSensor};
pub use types::{HostClock, Led, Pose, PoseMatchFlags, PoseMetrics};

/// Result type alias for tracker operations.
pub type Result<T> = std::result::Result<T, TrackerError>;
