use nalgebra::{UnitQuaternion, Vector3};
use std::time::Instant;

/// Rigid transform: rotation followed by translation, single precision.
///
/// Used for everything from LED-model-to-world poses down to the static
/// IMU-to-device-body offsets carried by each tracked device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub pos: Vector3<f32>,
    pub orient: UnitQuaternion<f32>,
}

impl Pose {
    pub fn identity() -> Pose {
        Pose {
            pos: Vector3::zeros(),
            orient: UnitQuaternion::identity(),
        }
    }

    pub fn new(pos: Vector3<f32>, orient: UnitQuaternion<f32>) -> Pose {
        Pose { pos, orient }
    }

    /// Apply `self` as a transform to `other`: the returned pose maps
    /// through `other` first, then `self`.
    pub fn apply(&self, other: &Pose) -> Pose {
        Pose {
            pos: self.orient * other.pos + self.pos,
            orient: self.orient * other.orient,
        }
    }

    pub fn inverse(&self) -> Pose {
        let inv_orient = self.orient.inverse();
        Pose {
            pos: -(inv_orient * self.pos),
            orient: inv_orient,
        }
    }

    /// Rotate a vector by this pose's orientation.
    pub fn rotate(&self, v: &Vector3<f32>) -> Vector3<f32> {
        self.orient * v
    }

    /// Rotate a vector and take the per-component absolute value.
    ///
    /// Covariance extents stay meaningful when moved between frames this
    /// way; a plain rotation would produce signed extents.
    pub fn rotate_abs(&self, v: &Vector3<f32>) -> Vector3<f32> {
        (self.orient * v).abs()
    }

    /// Rotation taking `from`'s orientation to this pose's orientation,
    /// as a scaled-axis vector (radians).
    pub fn orient_diff(&self, from: &Pose) -> Vector3<f32> {
        (from.orient.inverse() * self.orient).scaled_axis()
    }
}

impl Default for Pose {
    fn default() -> Pose {
        Pose::identity()
    }
}

bitflags::bitflags! {
    /// Quality flags attached to a candidate pose by the vision pipeline.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PoseMatchFlags: u32 {
        /// The blob/LED correspondences were a good overall match.
        const MATCH_GOOD     = 1 << 0;
        /// The solved position agrees with the filter prior.
        const MATCH_POSITION = 1 << 1;
        /// The solved orientation agrees with the filter prior.
        const MATCH_ORIENT   = 1 << 2;
        /// The pose was solved against a strong (many-LED) constellation view.
        const MATCH_STRONG   = 1 << 3;
    }
}

/// Score the vision pipeline attaches to each candidate pose.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoseMetrics {
    pub flags: PoseMatchFlags,
    pub matched_blobs: u32,
    pub unmatched_blobs: u32,
    pub visible_leds: u32,
    pub reprojection_error: f64,
}

impl PoseMetrics {
    pub fn has_flags(&self, flags: PoseMatchFlags) -> bool {
        self.flags.contains(flags)
    }
}

/// One IR LED of a device's constellation model, in model coordinates.
#[derive(Debug, Clone, Copy)]
pub struct Led {
    pub pos: Vector3<f32>,
    pub dir: Vector3<f32>,
    /// 10-bit blink pattern the LED cycles through, phase-locked to exposures.
    pub pattern: u16,
}

/// Host monotonic clock, reported as nanoseconds since tracker start.
#[derive(Debug, Clone, Copy)]
pub struct HostClock {
    epoch: Instant,
}

impl HostClock {
    pub fn new() -> HostClock {
        HostClock {
            epoch: Instant::now(),
        }
    }

    pub fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}

impl Default for HostClock {
    fn default() -> HostClock {
        HostClock::new()
    }
}
