use crate::exp_filter::ExpFilterPose;
use crate::exposure::{DeviceExposureInfo, ExposureInfo, MAX_SENSORS};
use crate::fusion::FusionFilter;
use crate::trace::DeviceTrace;
use crate::types::{Led, Pose, PoseMatchFlags, PoseMetrics};
use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use std::sync::Mutex;

/// Number of lagged filter slots available for in-flight exposures.
pub const NUM_POSE_DELAY_SLOTS: usize = 3;

/// IMU observations accumulated before the trace ring is flushed.
pub const MAX_PENDING_IMU_OBSERVATIONS: usize = 1000;

/// Without a positional observation for this long, the position is held
/// and velocities are clamped to zero.
const POSE_LOST_THRESHOLD_NS: u64 = 500 * 1_000_000;

/// Without an orientation match for this long, the next observation's
/// orientation is accepted even on a weak score.
const POSE_LOST_ORIENT_THRESHOLD_NS: u64 = 100 * 1_000_000;

/// One candidate pose delivered for an exposure, kept with its slot.
#[derive(Debug, Clone, Copy)]
struct PoseReport {
    /// Whether this report was integrated into the filter.
    report_used: bool,
    #[allow(dead_code)]
    pose: Pose,
    #[allow(dead_code)]
    score: PoseMetrics,
}

/// Anchor into the fusion filter's lagged state for one exposure.
#[derive(Debug)]
struct DelaySlot {
    slot_id: usize,
    /// Set while the slot holds exposure info.
    valid: bool,
    /// Number of camera frames currently referencing this slot.
    use_count: u32,
    /// Device time this slot is tracking.
    device_time_ns: u64,
    reports: Vec<PoseReport>,
    n_used_reports: u32,
}

impl DelaySlot {
    fn new(slot_id: usize) -> DelaySlot {
        DelaySlot {
            slot_id,
            valid: false,
            use_count: 0,
            device_time_ns: 0,
            reports: Vec::with_capacity(MAX_SENSORS),
            n_used_reports: 0,
        }
    }
}

/// One inertial sample, recorded for the trace sink.
#[derive(Debug, Clone, Copy)]
struct ImuObservation {
    local_ts: u64,
    device_ts: u64,
    dt: f32,
    ang_vel: Vector3<f32>,
    accel: Vector3<f32>,
    mag: Vector3<f32>,
}

/// Smoothed device pose and motion state handed to the application.
#[derive(Debug, Clone, Copy)]
pub struct ViewPose {
    pub pose: Pose,
    pub lin_vel: Vector3<f32>,
    pub lin_accel: Vector3<f32>,
    pub ang_vel: Vector3<f32>,
}

struct DeviceState {
    filter: Box<dyn FusionFilter>,

    delay_slot_cursor: usize,
    delay_slots: [DelaySlot; NUM_POSE_DELAY_SLOTS],

    /// Device body pose relative to the IMU frame.
    device_from_fusion: Pose,
    /// IMU frame relative to the LED model frame, and its inverse.
    fusion_from_model: Pose,
    model_from_fusion: Pose,

    /// Raw 32-bit device timestamp (µs) from the last IMU packet.
    last_device_ts: u32,
    /// Extended device clock, nanoseconds. Monotonic non-decreasing.
    device_time_ns: u64,

    #[allow(dead_code)]
    last_observed_orient_ns: u64,
    last_observed_pose_ns: u64,
    #[allow(dead_code)]
    last_observed_pose: Pose,

    last_reported_pose_ns: u64,
    reported_pose: Pose,
    model_pose: Pose,

    output_filter: ExpFilterPose,

    pending_imu: Vec<ImuObservation>,
    trace: DeviceTrace,
}

/// One device tracked by the constellation system: the HMD or a
/// controller. Serializes all access to its fusion filter and delay
/// slots behind a single device lock.
pub struct TrackedDevice {
    id: i32,
    index: usize,
    leds: Vec<Led>,
    state: Mutex<DeviceState>,
}

impl TrackedDevice {
    /// `imu_pose` is the IMU's pose in the device body frame, `model_pose`
    /// the device body's pose in the LED model frame.
    pub(crate) fn new(
        id: i32,
        index: usize,
        imu_pose: &Pose,
        model_pose: &Pose,
        leds: Vec<Led>,
        mut filter: Box<dyn FusionFilter>,
    ) -> TrackedDevice {
        // Rotate the initial pose 180 degrees to point along -Z
        let init_pose = Pose::new(
            Vector3::zeros(),
            UnitQuaternion::from_quaternion(Quaternion::new(0.0, 0.0, 1.0, 0.0)),
        );
        filter.init(&init_pose, NUM_POSE_DELAY_SLOTS);

        let device_from_fusion = imu_pose.inverse();
        let fusion_from_model = model_pose.apply(imu_pose);
        let model_from_fusion = fusion_from_model.inverse();

        let mut trace = DeviceTrace::new(&format!("rift-device-{}", id));
        if trace.enabled() {
            trace.push(&format!("{{ \"type\": \"device\", \"device-id\": {} }}", id));
        }

        TrackedDevice {
            id,
            index,
            leds,
            state: Mutex::new(DeviceState {
                filter,
                delay_slot_cursor: 0,
                delay_slots: [DelaySlot::new(0), DelaySlot::new(1), DelaySlot::new(2)],
                device_from_fusion,
                fusion_from_model,
                model_from_fusion,
                last_device_ts: 0,
                device_time_ns: 0,
                last_observed_orient_ns: 0,
                last_observed_pose_ns: 0,
                last_observed_pose: Pose::identity(),
                last_reported_pose_ns: 0,
                reported_pose: Pose::identity(),
                model_pose: Pose::identity(),
                output_filter: ExpFilterPose::new(),
                pending_imu: Vec::with_capacity(MAX_PENDING_IMU_OBSERVATIONS),
                trace,
            }),
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    /// Index of this device in the tracker's table, and therefore into
    /// [`ExposureInfo::devices`](crate::exposure::ExposureInfo::devices).
    pub fn index(&self) -> usize {
        self.index
    }

    /// The device's LED constellation model, for the vision pipeline.
    pub fn leds(&self) -> &[Led] {
        &self.leds
    }

    /// Current extended device clock, nanoseconds.
    pub fn device_time_ns(&self) -> u64 {
        self.state.lock().unwrap().device_time_ns
    }

    /// Feed one inertial sample. `device_ts` is the device's raw 32-bit
    /// microsecond clock; wraparound is handled by extending into the
    /// 64-bit nanosecond clock.
    pub fn imu_update(
        &self,
        local_ts: u64,
        device_ts: u32,
        dt: f32,
        ang_vel: &Vector3<f32>,
        accel: &Vector3<f32>,
        mag: &Vector3<f32>,
    ) {
        let mut guard = self.state.lock().unwrap();
        let s = &mut *guard;

        if s.device_time_ns == 0 {
            s.device_time_ns = device_ts as u64 * 1000;
        } else {
            let dt_ns = device_ts.wrapping_sub(s.last_device_ts) as u64 * 1000;
            s.device_time_ns += dt_ns;
        }
        s.last_device_ts = device_ts;

        s.filter.imu_update(s.device_time_ns, ang_vel, accel, mag);

        s.pending_imu.push(ImuObservation {
            local_ts,
            device_ts: s.device_time_ns,
            dt,
            ang_vel: *ang_vel,
            accel: *accel,
            mag: *mag,
        });

        if s.pending_imu.len() == MAX_PENDING_IMU_OBSERVATIONS {
            // No camera observations for a while - flush from here instead
            flush_imu_trace(s);
        }
    }

    /// Latest smoothed device-body pose, velocity, acceleration and
    /// angular velocity, for the application.
    pub fn get_view_pose(&self) -> ViewPose {
        let mut guard = self.state.lock().unwrap();
        let s = &mut *guard;

        let t = s.device_time_ns;
        let fs = s.filter.pose_at(t);
        let mut lin_vel = fs.lin_vel;
        let mut lin_accel = fs.lin_accel;

        if t > s.last_reported_pose_ns {
            // Take the fusion/IMU global pose back to a device body pose
            let mut device_pose = s.device_from_fusion.apply(&fs.pose);

            s.reported_pose.orient = device_pose.orient;
            if t - s.last_observed_pose_ns >= POSE_LOST_THRESHOLD_NS {
                // Don't let the device move without a recent observation
                // of actual position
                device_pose.pos = s.reported_pose.pos;
                lin_vel = Vector3::zeros();
                lin_accel = Vector3::zeros();
            }

            let filtered = s.output_filter.run(t, &device_pose);
            s.reported_pose = filtered;
            s.last_reported_pose_ns = t;
        }

        // Angular velocity and acceleration need rotating into device
        // space. Linear velocity also acquires a component from angular
        // velocity at the IMU offset.
        let dff = s.device_from_fusion;
        let ang_vel = dff.rotate(&fs.ang_vel);
        let accel = dff.rotate(&lin_accel);

        let rotated_imu_pos = dff.rotate(&dff.pos);
        let extra_lin_vel = ang_vel.cross(&rotated_imu_pos);
        let vel = dff.rotate(&lin_vel) + extra_lin_vel;

        ViewPose {
            pose: s.reported_pose,
            lin_vel: vel,
            lin_accel: accel,
            ang_vel,
        }
    }

    /// Latest model-frame pose estimate with its uncertainty extents.
    pub fn model_pose(&self) -> (Pose, Vector3<f32>, Vector3<f32>) {
        let mut guard = self.state.lock().unwrap();
        model_pose_locked(&mut guard)
    }

    /// Refresh a delay slot's capture pose estimate from the filter.
    ///
    /// Pose updates and IMU data arriving between frame capture and the
    /// visual search can improve the estimate of where the device was at
    /// the exposure. Returns false and clears `fusion_slot` if the slot
    /// was reclaimed meanwhile.
    pub fn latest_exposure_pose(&self, dev_info: &mut DeviceExposureInfo) -> bool {
        if dev_info.fusion_slot == -1 {
            return false;
        }

        let mut guard = self.state.lock().unwrap();
        let s = &mut *guard;

        match matching_delay_slot(s, dev_info) {
            Some(slot_idx) => {
                let fs = s.filter.delay_slot_pose_at(dev_info.device_time_ns, slot_idx);
                dev_info.capture_pose = s.model_from_fusion.apply(&fs.pose);
                dev_info.pos_error = s.model_from_fusion.rotate_abs(&fs.pos_error);
                dev_info.rot_error = s.model_from_fusion.rotate_abs(&fs.rot_error);
                true
            }
            None => {
                // The delay slot was overridden; clear it in the info
                dev_info.fusion_slot = -1;
                false
            }
        }
    }

    /// Deliver a scored model-frame pose observation from the vision
    /// pipeline, tied to the exposure the frame was captured under.
    /// Returns whether any part of the observation was accepted.
    pub fn model_pose_update(
        &self,
        local_ts: u64,
        frame_start_local_ts: u64,
        exposure_info: &ExposureInfo,
        score: &PoseMetrics,
        model_pose: &Pose,
        source: &str,
    ) -> bool {
        let mut guard = self.state.lock().unwrap();
        let s = &mut *guard;

        // Apply the fusion-from-model pose on top of the model-frame pose
        // to get the global IMU pose
        let imu_pose = s.fusion_from_model.apply(model_pose);

        flush_imu_trace(s);

        let mut frame_device_time_ns = 0;
        let mut frame_fusion_slot = -1;
        let mut update_position = false;
        let mut update_orientation = false;

        if self.index < exposure_info.n_devices {
            // This device existed when the exposure was taken
            let dev_info = &exposure_info.devices[self.index];
            frame_device_time_ns = dev_info.device_time_ns;

            if let Some(slot_idx) = matching_delay_slot(s, dev_info) {
                let pos_error = model_pose.pos - dev_info.capture_pose.pos;
                let rot_error = model_pose.orient_diff(&dev_info.capture_pose);

                log::debug!(
                    "Got pose update for delay slot {} for dev {}, ts {} (delay {}) pos diff {:?} rot diff {:?} from {}",
                    slot_idx,
                    self.id,
                    frame_device_time_ns,
                    (s.device_time_ns - frame_device_time_ns) as f64 / 1_000_000_000.0,
                    pos_error,
                    rot_error,
                    source
                );

                // An observation based on a prior whose position didn't
                // match is useless once a newer observation already came in
                if dev_info.had_pose_lock
                    && !score.has_flags(PoseMatchFlags::MATCH_POSITION)
                    && s.last_observed_pose_ns > frame_device_time_ns
                {
                    log::info!(
                        "Ignoring position observation with error {:?} (prior stddev was {:?})",
                        pos_error,
                        dev_info.pos_error
                    );
                } else {
                    update_position = true;
                }

                if score.has_flags(PoseMatchFlags::MATCH_ORIENT) {
                    update_orientation = true;
                    if s.device_time_ns - s.last_observed_pose_ns > POSE_LOST_ORIENT_THRESHOLD_NS {
                        log::info!(
                            "Matched orientation after {} sec",
                            (s.device_time_ns - s.last_observed_pose_ns) as f64 / 1_000_000_000.0
                        );
                    }
                    // Only update the time if this matched orientation is
                    // actually applied below
                    if update_position {
                        s.last_observed_orient_ns = s.device_time_ns;
                    }
                } else if s.device_time_ns - s.last_observed_pose_ns > POSE_LOST_ORIENT_THRESHOLD_NS
                {
                    log::info!("Forcing orientation observation");
                    update_orientation = true;
                    // Not an actual match, so the orientation match time stays
                }

                if update_position {
                    let t = s.device_time_ns;
                    if update_orientation {
                        s.filter.pose_update(t, &imu_pose, slot_idx);
                    } else {
                        s.filter.position_update(t, &imu_pose.pos, slot_idx);
                    }

                    s.last_observed_pose_ns = t;
                    s.last_observed_pose = imu_pose;
                }

                frame_fusion_slot = slot_idx as i32;

                let slot = &mut s.delay_slots[slot_idx];
                if slot.reports.len() < MAX_SENSORS {
                    slot.reports.push(PoseReport {
                        report_used: update_position,
                        pose: imu_pose,
                        score: *score,
                    });
                    if update_position {
                        slot.n_used_reports += 1;
                    }
                }
            }
        }

        let device_time_ns = s.device_time_ns;
        trace_event(
            s,
            || format!(
                "{{ \"type\": \"pose\", \"local-ts\": {}, \"device-ts\": {}, \
                 \"frame-start-local-ts\": {}, \"frame-local-ts\": {}, \"frame-hmd-ts\": {}, \
                 \"frame-exposure-count\": {}, \"frame-device-ts\": {}, \"frame-fusion-slot\": {}, \
                 \"source\": \"{}\", \
                 \"pos\": [ {}, {}, {} ], \
                 \"orient\": [ {}, {}, {}, {} ] }}",
                local_ts,
                device_time_ns,
                frame_start_local_ts,
                exposure_info.local_ts,
                exposure_info.hmd_ts,
                exposure_info.count,
                frame_device_time_ns,
                frame_fusion_slot,
                source,
                model_pose.pos.x,
                model_pose.pos.y,
                model_pose.pos.z,
                model_pose.orient.i,
                model_pose.orient.j,
                model_pose.orient.k,
                model_pose.orient.w,
            ),
        );

        update_position || update_orientation
    }

    /// Release the delay slot a finished frame was holding for this device.
    pub fn frame_release(&self, exposure_info: &mut ExposureInfo) {
        let mut guard = self.state.lock().unwrap();
        let s = &mut *guard;
        if self.index < exposure_info.n_devices {
            exposure_release(s, self.id, &mut exposure_info.devices[self.index]);
        }
    }

    /// Allocate a delay slot for a new exposure and snapshot the predicted
    /// state into `dev_info`. Called by the tracker on exposure arrival.
    pub(crate) fn note_exposure(
        &self,
        local_ts: u64,
        hmd_ts: u32,
        exposure_hmd_ts: u32,
        count: u16,
        dev_info: &mut DeviceExposureInfo,
    ) {
        let mut guard = self.state.lock().unwrap();
        let s = &mut *guard;

        on_new_exposure(s, self.id, dev_info);

        flush_imu_trace(s);
        let (device_time_ns, fusion_slot) = (dev_info.device_time_ns, dev_info.fusion_slot);
        trace_event(
            s,
            || format!(
                "{{ \"type\": \"exposure\", \"local-ts\": {}, \"hmd-ts\": {}, \
                 \"exposure-ts\": {}, \"count\": {}, \"device-ts\": {}, \"delay-slot\": {} }}",
                local_ts, hmd_ts, exposure_hmd_ts, count, device_time_ns, fusion_slot
            ),
        );
    }

    /// Claim the delay slot matching `dev_info` for an arriving frame.
    pub(crate) fn exposure_claim(&self, dev_info: &mut DeviceExposureInfo) {
        let mut guard = self.state.lock().unwrap();
        exposure_claim(&mut guard, self.id, dev_info);
    }

    /// Release the delay slot matching `dev_info`.
    pub(crate) fn exposure_release(&self, dev_info: &mut DeviceExposureInfo) {
        let mut guard = self.state.lock().unwrap();
        exposure_release(&mut guard, self.id, dev_info);
    }

    pub(crate) fn trace_frame_start(&self, local_ts: u64, source: &str) {
        let mut guard = self.state.lock().unwrap();
        let s = &mut *guard;
        trace_event(s, || {
            format!(
                "{{ \"type\": \"frame-start\", \"local-ts\": {}, \"source\": \"{}\" }}",
                local_ts, source
            )
        });
    }

    pub(crate) fn trace_frame_captured(
        &self,
        local_ts: u64,
        frame_start_local_ts: u64,
        source: &str,
        fusion_slot: i32,
    ) {
        let mut guard = self.state.lock().unwrap();
        let s = &mut *guard;
        trace_event(s, || {
            format!(
                "{{ \"type\": \"frame-captured\", \"local-ts\": {}, \
                 \"frame-start-local-ts\": {}, \"source\": \"{}\", \"delay-slot\": {} }}",
                local_ts, frame_start_local_ts, source, fusion_slot
            )
        });
    }

    pub(crate) fn trace_frame_release(
        &self,
        local_ts: u64,
        frame_local_ts: u64,
        source: &str,
        fusion_slot: i32,
    ) {
        let mut guard = self.state.lock().unwrap();
        let s = &mut *guard;
        trace_event(s, || {
            format!(
                "{{ \"type\": \"frame-release\", \"local-ts\": {}, \
                 \"frame-local-ts\": {}, \"source\": \"{}\", \"delay-slot\": {} }}",
                local_ts, frame_local_ts, source, fusion_slot
            )
        });
    }

    #[cfg(test)]
    fn slot_report_counts(&self, slot_idx: usize) -> (usize, u32) {
        let s = self.state.lock().unwrap();
        let slot = &s.delay_slots[slot_idx];
        (slot.reports.len(), slot.n_used_reports)
    }

    #[cfg(test)]
    fn pending_imu_len(&self) -> usize {
        self.state.lock().unwrap().pending_imu.len()
    }
}

impl std::fmt::Debug for TrackedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedDevice")
            .field("id", &self.id)
            .field("index", &self.index)
            .finish()
    }
}

/// Model-frame pose with position held while tracking is lost.
fn model_pose_locked(s: &mut DeviceState) -> (Pose, Vector3<f32>, Vector3<f32>) {
    let t = s.device_time_ns;
    let fs = s.filter.pose_at(t);

    let model_pose = s.model_from_fusion.apply(&fs.pose);
    let pos_error = s.model_from_fusion.rotate_abs(&fs.pos_error);
    let rot_error = s.model_from_fusion.rotate_abs(&fs.rot_error);

    s.model_pose.orient = model_pose.orient;
    if t - s.last_observed_pose_ns < POSE_LOST_THRESHOLD_NS {
        // Don't let the device move without a recent observation of
        // actual position
        s.model_pose.pos = model_pose.pos;
    }

    (s.model_pose, pos_error, rot_error)
}

/// Cycle through the delay slots looking for an unreferenced one.
fn find_free_delay_slot(s: &mut DeviceState) -> Option<usize> {
    for _ in 0..NUM_POSE_DELAY_SLOTS {
        let slot_no = s.delay_slot_cursor;
        s.delay_slot_cursor = (slot_no + 1) % NUM_POSE_DELAY_SLOTS;

        if s.delay_slots[slot_no].use_count == 0 {
            return Some(slot_no);
        }
    }
    None
}

/// A slot that already delivered an integrated pose observation can be
/// repurposed for a newer exposure.
fn reclaim_delay_slot(s: &DeviceState) -> Option<usize> {
    s.delay_slots
        .iter()
        .position(|slot| slot.valid && slot.n_used_reports > 0)
}

fn matching_delay_slot(s: &DeviceState, dev_info: &DeviceExposureInfo) -> Option<usize> {
    let slot_no = dev_info.fusion_slot;
    if slot_no < 0 || slot_no as usize >= NUM_POSE_DELAY_SLOTS {
        return None;
    }

    let slot = &s.delay_slots[slot_no as usize];
    if slot.valid && slot.device_time_ns == dev_info.device_time_ns {
        Some(slot_no as usize)
    } else {
        None
    }
}

fn on_new_exposure(s: &mut DeviceState, id: i32, dev_info: &mut DeviceExposureInfo) {
    dev_info.device_time_ns = s.device_time_ns;

    let mut slot_idx = find_free_delay_slot(s);
    if slot_idx.is_none() {
        // A busy slot can be reclaimed if a frame search is being slow and
        // another camera already delivered an observation
        slot_idx = reclaim_delay_slot(s);
        if let Some(i) = slot_idx {
            log::info!(
                "Reclaimed delay slot {} for dev {}, ts {} (delay {})",
                i,
                id,
                s.device_time_ns,
                (s.device_time_ns - s.delay_slots[i].device_time_ns) as f64 / 1_000_000_000.0
            );
        }
    }

    match slot_idx {
        Some(i) => {
            let t = s.device_time_ns;
            let slot = &mut s.delay_slots[i];
            slot.device_time_ns = t;
            slot.valid = true;
            slot.use_count = 0;
            slot.reports.clear();
            slot.n_used_reports = 0;

            dev_info.fusion_slot = slot.slot_id as i32;
            dev_info.had_pose_lock = t - s.last_observed_pose_ns < POSE_LOST_THRESHOLD_NS;

            log::debug!("Assigning free delay slot {} for dev {}, ts {}", i, id, t);

            let (pose, pos_error, rot_error) = model_pose_locked(s);
            dev_info.capture_pose = pose;
            dev_info.pos_error = pos_error;
            dev_info.rot_error = rot_error;

            s.filter.prepare_delay_slot(t, i);
        }
        None => {
            log::warn!("No free delay slot for dev {}, ts {}", id, s.device_time_ns);
            dev_info.fusion_slot = -1;
        }
    }
}

fn exposure_claim(s: &mut DeviceState, id: i32, dev_info: &mut DeviceExposureInfo) {
    match matching_delay_slot(s, dev_info) {
        Some(i) => {
            let slot = &mut s.delay_slots[i];
            slot.use_count += 1;
            dev_info.fusion_slot = slot.slot_id as i32;

            log::debug!(
                "Claimed delay slot {} for dev {}, ts {}. use_count now {}",
                i,
                id,
                dev_info.device_time_ns,
                slot.use_count
            );
        }
        None => {
            // The slot was never allocated (the exposure event was
            // missed), or a later exposure overrode it
            if dev_info.fusion_slot != -1 {
                log::debug!(
                    "Lost delay slot {} for dev {}, ts {}",
                    dev_info.fusion_slot,
                    id,
                    dev_info.device_time_ns
                );
                dev_info.fusion_slot = -1;
            }
        }
    }
}

fn exposure_release(s: &mut DeviceState, id: i32, dev_info: &mut DeviceExposureInfo) {
    if let Some(i) = matching_delay_slot(s, dev_info) {
        let slot = &mut s.delay_slots[i];
        if slot.use_count > 0 {
            slot.use_count -= 1;
            log::debug!(
                "Released delay slot {} for dev {}, ts {}. use_count now {}",
                i,
                id,
                dev_info.device_time_ns,
                slot.use_count
            );
        }

        if slot.use_count == 0 {
            slot.valid = false;
            log::debug!(
                "Invalidating delay slot {} for dev {}, ts {} with {} poses reported {} used",
                i,
                id,
                dev_info.device_time_ns,
                slot.reports.len(),
                slot.n_used_reports
            );
            s.filter.release_delay_slot(i);
        }

        // Clear the slot from this info so it doesn't get released twice
        dev_info.fusion_slot = -1;
    }
}

fn flush_imu_trace(s: &mut DeviceState) {
    if s.pending_imu.is_empty() {
        return;
    }

    if s.trace.enabled() {
        for obs in &s.pending_imu {
            let line = format!(
                "{{ \"type\": \"imu\", \"local-ts\": {}, \"device-ts\": {}, \"dt\": {}, \
                 \"ang_vel\": [ {}, {}, {} ], \"accel\": [ {}, {}, {} ], \
                 \"mag\": [ {}, {}, {} ] }}",
                obs.local_ts,
                obs.device_ts,
                obs.dt,
                obs.ang_vel.x,
                obs.ang_vel.y,
                obs.ang_vel.z,
                obs.accel.x,
                obs.accel.y,
                obs.accel.z,
                obs.mag.x,
                obs.mag.y,
                obs.mag.z
            );
            s.trace.push(&line);
        }
    }

    s.pending_imu.clear();
}

fn trace_event(s: &mut DeviceState, line: impl FnOnce() -> String) {
    if s.trace.enabled() {
        // Pending IMU observations come first so the trace stays ordered
        flush_imu_trace(s);
        let line = line();
        s.trace.push(&line);
    }
}
