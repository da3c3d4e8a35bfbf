use crate::types::Pose;

/// Position smoothing time constant, seconds.
const POS_TIME_CONSTANT: f32 = 0.025;
/// Orientation smoothing time constant, seconds.
const ORIENT_TIME_CONSTANT: f32 = 0.05;

/// Exponential moving filter over a pose.
///
/// Smooths the view pose handed to the application without adding the
/// latency a windowed filter would. The blend factor adapts to the time
/// step, so irregular query rates don't change the effective bandwidth.
#[derive(Debug, Clone)]
pub struct ExpFilterPose {
    last_ts: u64,
    have_pose: bool,
    pose: Pose,
}

impl ExpFilterPose {
    pub fn new() -> ExpFilterPose {
        ExpFilterPose {
            last_ts: 0,
            have_pose: false,
            pose: Pose::identity(),
        }
    }

    /// Feed a pose observed at device time `ts` (nanoseconds) and return
    /// the smoothed output. The first sample passes through unchanged.
    pub fn run(&mut self, ts: u64, pose: &Pose) -> Pose {
        if !self.have_pose || ts <= self.last_ts {
            self.pose = *pose;
            self.have_pose = true;
            self.last_ts = ts;
            return self.pose;
        }

        let dt = (ts - self.last_ts) as f32 / 1_000_000_000.0;
        let pos_alpha = 1.0 - (-dt / POS_TIME_CONSTANT).exp();
        let orient_alpha = 1.0 - (-dt / ORIENT_TIME_CONSTANT).exp();

        self.pose.pos += (pose.pos - self.pose.pos) * pos_alpha;
        self.pose.orient = self
            .pose
            .orient
            .try_slerp(&pose.orient, orient_alpha, 1.0e-6)
            .unwrap_or(pose.orient);
        self.last_ts = ts;

        self.pose
    }
}

impl Default for ExpFilterPose {
    fn default() -> ExpFilterPose {
        ExpFilterPose::new()
    }
}
