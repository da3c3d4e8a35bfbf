use crate::types::Pose;
use nalgebra::Vector3;

/// Filter estimate at a point in time: pose plus first and second
/// derivatives, and the position/orientation uncertainty extents
/// (standard deviations, in the filter's global frame).
#[derive(Debug, Clone, Copy)]
pub struct FilterState {
    pub pose: Pose,
    pub lin_vel: Vector3<f32>,
    pub lin_accel: Vector3<f32>,
    pub ang_vel: Vector3<f32>,
    pub pos_error: Vector3<f32>,
    pub rot_error: Vector3<f32>,
}

impl Default for FilterState {
    fn default() -> FilterState {
        FilterState {
            pose: Pose::identity(),
            lin_vel: Vector3::zeros(),
            lin_accel: Vector3::zeros(),
            ang_vel: Vector3::zeros(),
            pos_error: Vector3::zeros(),
            rot_error: Vector3::zeros(),
        }
    }
}

/// Operations the tracking core needs from the 6-DoF fusion filter.
///
/// The filter estimates the IMU frame's pose in world coordinates. Visual
/// corrections are applied retroactively through numbered delay slots: the
/// core calls [`prepare_delay_slot`](FusionFilter::prepare_delay_slot) at
/// the exposure instant, later feeds position/pose updates tagged with the
/// slot id, and finally releases the slot once every camera frame that
/// referenced the exposure is done with it.
///
/// All calls for one device are serialized by the device lock.
pub trait FusionFilter: Send {
    /// Reset to `init_pose` with `n_delay_slots` lagged-state slots.
    fn init(&mut self, init_pose: &Pose, n_delay_slots: usize);

    /// Advance the filter to `time_ns` with one inertial sample.
    fn imu_update(
        &mut self,
        time_ns: u64,
        ang_vel: &Vector3<f32>,
        accel: &Vector3<f32>,
        mag: &Vector3<f32>,
    );

    /// Apply a position-only correction anchored at delay slot `slot_id`.
    fn position_update(&mut self, time_ns: u64, pos: &Vector3<f32>, slot_id: usize);

    /// Apply a full pose correction anchored at delay slot `slot_id`.
    fn pose_update(&mut self, time_ns: u64, pose: &Pose, slot_id: usize);

    /// Start tracking lagged state for an exposure at `time_ns`.
    fn prepare_delay_slot(&mut self, time_ns: u64, slot_id: usize);

    /// The slot no longer constrains the filter.
    fn release_delay_slot(&mut self, slot_id: usize);

    /// Estimate at `time_ns` from the current (front) state.
    fn pose_at(&mut self, time_ns: u64) -> FilterState;

    /// Estimate at `time_ns` from the lagged state held in `slot_id`.
    fn delay_slot_pose_at(&mut self, time_ns: u64, slot_id: usize) -> FilterState;
}
