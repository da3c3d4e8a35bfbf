use crate::device::TrackedDevice;
use crate::error::TrackerError;
use crate::exposure::{ExposureInfo, MAX_SENSORS, MAX_TRACKED_DEVICES};
use crate::fusion::FusionFilter;
use crate::profile::{SensorVariant, SENSOR_VID};
use crate::stream::UvcStream;
use crate::types::{HostClock, Led, Pose};
use crate::Result;
use nalgebra::Vector3;
use rusb::UsbContext;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Room calibration: where each camera sits and how the whole play space
/// is offset. Loading and saving this is the caller's concern.
#[derive(Debug, Clone, Default)]
pub struct TrackerConfig {
    pub room_center_offset: Vector3<f32>,
    /// Calibrated world pose per sensor serial number.
    pub sensor_poses: HashMap<String, Pose>,
}

/// What the tracker needs from a constellation camera's processing side.
///
/// Implementations run the vision pipeline: they consume video frames,
/// search them for LED constellations and deliver candidate poses back
/// through [`TrackedDevice::model_pose_update`]. Exposure notifications
/// arrive outside the tracker lock, so implementations are free to call
/// back into the tracker.
pub trait TrackerSensor: Send + Sync {
    fn serial(&self) -> &str;

    /// Start tracking a newly registered device. Returns false if the
    /// sensor could not configure it.
    fn on_new_device(&self, device: &Arc<TrackedDevice>) -> bool;

    /// A new exposure snapshot was published.
    fn update_exposure(&self, info: &ExposureInfo);

    /// The sensor's calibrated world pose.
    fn set_pose(&self, pose: &Pose);
}

struct TrackerState {
    have_exposure_info: bool,
    exposure_info: ExposureInfo,
    config: TrackerConfig,
    sensors: Vec<Arc<dyn TrackerSensor>>,
    devices: Vec<Arc<TrackedDevice>>,
}

/// Coordination hub for constellation tracking.
///
/// Owns the USB context and its event thread, the tracked-device and
/// sensor tables, and the global exposure record. Lock order is always
/// tracker state before device state, and no lock is held across a
/// callback into sensor code.
///
/// Video streams must be stopped before the tracker is dropped: the
/// stream drain relies on this tracker's event thread still pumping.
pub struct Tracker {
    usb_ctx: rusb::Context,
    clock: HostClock,
    state: Mutex<TrackerState>,
    usb_completed: Arc<AtomicBool>,
    usb_thread: Option<JoinHandle<()>>,
}

impl Tracker {
    pub fn new(config: TrackerConfig) -> Result<Tracker> {
        let usb_ctx = rusb::Context::new()?;

        let usb_completed = Arc::new(AtomicBool::new(false));
        let completed = usb_completed.clone();
        let event_ctx = usb_ctx.clone();
        let usb_thread = std::thread::Builder::new()
            .name("rift-usb-events".into())
            .spawn(move || {
                while !completed.load(Ordering::Acquire) {
                    if let Err(e) = event_ctx.handle_events(Some(Duration::from_millis(100))) {
                        log::warn!("USB event handling error: {}", e);
                    }
                }
            })?;

        Ok(Tracker {
            usb_ctx,
            clock: HostClock::new(),
            state: Mutex::new(TrackerState {
                have_exposure_info: false,
                exposure_info: ExposureInfo::default(),
                config,
                sensors: Vec::new(),
                devices: Vec::new(),
            }),
            usb_completed,
            usb_thread: Some(usb_thread),
        })
    }

    pub fn usb_context(&self) -> &rusb::Context {
        &self.usb_ctx
    }

    pub fn clock(&self) -> HostClock {
        self.clock
    }

    /// Open every constellation camera on the bus and prepare its video
    /// stream. Returns `(serial, stream)` pairs; sensors that fail to
    /// open are skipped with an error log.
    pub fn open_sensor_streams(&self) -> Result<Vec<(String, UvcStream)>> {
        let mut streams = Vec::new();

        for device in self.usb_ctx.devices()?.iter() {
            let desc = match device.device_descriptor() {
                Ok(d) => d,
                Err(_) => continue,
            };
            if desc.vendor_id() != SENSOR_VID
                || SensorVariant::from_product_id(desc.product_id()).is_none()
            {
                continue;
            }

            let handle = match device.open() {
                Ok(h) => h,
                Err(e) => {
                    log::error!("Failed to open Rift sensor device: {}. Check permissions", e);
                    continue;
                }
            };

            let serial = handle
                .read_serial_number_string_ascii(&desc)
                .unwrap_or_else(|e| {
                    log::warn!("Failed to read sensor serial number: {}", e);
                    "UNKNOWN".to_string()
                });

            match UvcStream::setup(handle, self.clock) {
                Ok(stream) => {
                    streams.push((serial, stream));
                    if streams.len() == MAX_SENSORS {
                        log::info!(
                            "Found the maximum number of supported sensors: {}",
                            MAX_SENSORS
                        );
                        break;
                    }
                }
                Err(e) => log::error!("Failed to set up sensor {}: {}", serial, e),
            }
        }

        log::info!("Opened {} Rift sensor cameras", streams.len());
        Ok(streams)
    }

    /// Register a sensor. It receives the calibrated pose from the config
    /// (offset by the room center) and is told about existing devices.
    pub fn add_sensor(&self, sensor: Arc<dyn TrackerSensor>) {
        let (devices, pose) = {
            let mut st = self.state.lock().unwrap();
            let pose = st.config.sensor_poses.get(sensor.serial()).map(|p| {
                Pose::new(p.pos + st.config.room_center_offset, p.orient)
            });
            st.sensors.push(sensor.clone());
            (st.devices.clone(), pose)
        };

        if let Some(pose) = pose {
            sensor.set_pose(&pose);
        }
        for device in &devices {
            if !sensor.on_new_device(device) {
                log::error!(
                    "Failed to configure object tracking for device {}",
                    device.id()
                );
            }
        }
    }

    /// Register a tracked device. `imu_pose` is the IMU's pose in the
    /// device body frame, `model_pose` the body's pose in the LED model
    /// frame.
    pub fn add_device(
        &self,
        device_id: i32,
        imu_pose: &Pose,
        model_pose: &Pose,
        leds: Vec<Led>,
        filter: Box<dyn FusionFilter>,
    ) -> Result<Arc<TrackedDevice>> {
        let (device, sensors) = {
            let mut st = self.state.lock().unwrap();
            if st.devices.len() >= MAX_TRACKED_DEVICES {
                return Err(TrackerError::TooManyDevices);
            }

            let device = Arc::new(TrackedDevice::new(
                device_id,
                st.devices.len(),
                imu_pose,
                model_pose,
                leds,
                filter,
            ));
            st.devices.push(device.clone());
            (device, st.sensors.clone())
        };

        // Tell the sensors about the new device, outside the lock
        for sensor in &sensors {
            if !sensor.on_new_device(&device) {
                log::error!(
                    "Failed to configure object tracking for device {}",
                    device_id
                );
            }
        }

        log::info!("device {} online. Now tracking", device_id);
        Ok(device)
    }

    /// Snapshot of the current exposure record, if one was published yet.
    pub fn exposure_info(&self) -> Option<ExposureInfo> {
        let st = self.state.lock().unwrap();
        st.have_exposure_info.then_some(st.exposure_info)
    }

    /// Called from the HMD packet handling loop on every IMU report. If
    /// the embedded exposure counter advanced, a new exposure record is
    /// published: each device snapshots its predicted state into a delay
    /// slot, and the sensors are notified outside the tracker lock.
    pub fn on_new_exposure(
        &self,
        hmd_ts: u32,
        exposure_count: u16,
        exposure_hmd_ts: u32,
        led_pattern_phase: u8,
    ) {
        let mut notification = None;

        {
            let mut guard = self.state.lock().unwrap();
            let st = &mut *guard;

            if st.exposure_info.led_pattern_phase != led_pattern_phase {
                log::debug!(
                    "{} LED pattern phase changed to {}",
                    self.clock.now_ns() as f64 / 1_000_000.0,
                    led_pattern_phase
                );
                st.exposure_info.led_pattern_phase = led_pattern_phase;
            }

            if st.exposure_info.count != exposure_count {
                let now = self.clock.now_ns();

                st.exposure_info.local_ts = now;
                st.exposure_info.count = exposure_count;
                st.exposure_info.hmd_ts = exposure_hmd_ts;
                st.exposure_info.led_pattern_phase = led_pattern_phase;
                st.have_exposure_info = true;

                log::debug!(
                    "{} Have new exposure TS {} count {} LED pattern phase {}",
                    now as f64 / 1_000_000.0,
                    exposure_hmd_ts,
                    exposure_count,
                    led_pattern_phase
                );

                if (exposure_hmd_ts.wrapping_sub(hmd_ts) as i32) < -1500 {
                    log::warn!(
                        "Exposure timestamp {} was more than 1.5 IMU samples earlier than IMU ts {} by {} µs",
                        exposure_hmd_ts,
                        hmd_ts,
                        hmd_ts.wrapping_sub(exposure_hmd_ts)
                    );
                }

                st.exposure_info.n_devices = st.devices.len();

                for (i, dev) in st.devices.iter().enumerate() {
                    dev.note_exposure(
                        now,
                        hmd_ts,
                        exposure_hmd_ts,
                        exposure_count,
                        &mut st.exposure_info.devices[i],
                    );
                }
                // Clear the entries for non-existent devices
                for i in st.devices.len()..MAX_TRACKED_DEVICES {
                    st.exposure_info.devices[i].fusion_slot = -1;
                }

                notification = Some((st.exposure_info, st.sensors.clone()));
            }
        }

        // Tell sensors about the new exposure outside the lock, to avoid
        // deadlocks from callbacks
        if let Some((info, sensors)) = notification {
            for sensor in &sensors {
                sensor.update_exposure(&info);
            }
        }
    }

    /// A sensor started receiving a new video frame: claim each device's
    /// delay slot for the exposure the frame belongs to.
    pub fn frame_start(&self, local_ts: u64, source: &str, mut info: Option<&mut ExposureInfo>) {
        let st = self.state.lock().unwrap();
        for (i, dev) in st.devices.iter().enumerate() {
            // The device might not have exposure info for this frame if
            // it recently came online
            if let Some(info) = info.as_deref_mut() {
                if i < info.n_devices {
                    dev.exposure_claim(&mut info.devices[i]);
                }
            }
            dev.trace_frame_start(local_ts, source);
        }
    }

    /// A frame's exposure association changed mid-arrival: move each
    /// device's claim from the old exposure to the new one.
    pub fn frame_changed_exposure(
        &self,
        mut old_info: Option<&mut ExposureInfo>,
        mut new_info: Option<&mut ExposureInfo>,
    ) {
        let st = self.state.lock().unwrap();
        for (i, dev) in st.devices.iter().enumerate() {
            if let Some(info) = old_info.as_deref_mut() {
                if i < info.n_devices {
                    dev.exposure_release(&mut info.devices[i]);
                }
            }
            if let Some(info) = new_info.as_deref_mut() {
                if i < info.n_devices {
                    dev.exposure_claim(&mut info.devices[i]);
                }
            }
        }
    }

    /// A sensor finished capturing a frame.
    pub fn frame_captured(
        &self,
        local_ts: u64,
        frame_start_local_ts: u64,
        info: &ExposureInfo,
        source: &str,
    ) {
        let st = self.state.lock().unwrap();
        for (i, dev) in st.devices.iter().enumerate() {
            let mut fusion_slot = -1;
            if i < info.n_devices {
                let dev_info = &info.devices[i];
                log::debug!(
                    "Frame capture - ts {}, delay slot {} for dev {}",
                    dev_info.device_time_ns,
                    dev_info.fusion_slot,
                    dev.id()
                );
                fusion_slot = dev_info.fusion_slot;
            }
            dev.trace_frame_captured(local_ts, frame_start_local_ts, source, fusion_slot);
        }
    }

    /// A sensor is done with a frame: release each device's delay slot.
    pub fn frame_release(
        &self,
        local_ts: u64,
        frame_local_ts: u64,
        mut info: Option<&mut ExposureInfo>,
        source: &str,
    ) {
        let st = self.state.lock().unwrap();
        for (i, dev) in st.devices.iter().enumerate() {
            let mut fusion_slot = -1;
            if let Some(info) = info.as_deref_mut() {
                if i < info.n_devices {
                    dev.exposure_release(&mut info.devices[i]);
                    fusion_slot = info.devices[i].fusion_slot;
                }
            }
            dev.trace_frame_release(local_ts, frame_local_ts, source, fusion_slot);
        }
    }

    /// Store a refined calibrated pose for a sensor. Persisting the
    /// config is the caller's concern.
    pub fn update_sensor_pose(&self, serial: &str, new_pose: &Pose) {
        let mut st = self.state.lock().unwrap();
        st.config.sensor_poses.insert(serial.to_string(), *new_pose);
    }

    fn shutdown(&mut self) {
        self.usb_completed.store(true, Ordering::Release);
        if let Some(thread) = self.usb_thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exposure::DeviceExposureInfo;
    use crate::fusion::{FilterState, FusionFilter};
    use nalgebra::Vector3;

    struct NullFilter;

    impl FusionFilter for NullFilter {
        fn init(&mut self, _init_pose: &Pose, _n_delay_slots: usize) {}
        fn imu_update(
            &mut self,
            _time_ns: u64,
            _ang_vel: &Vector3<f32>,
            _accel: &Vector3<f32>,
            _mag: &Vector3<f32>,
        ) {
        }
        fn position_update(&mut self, _time_ns: u64, _pos: &Vector3<f32>, _slot_id: usize) {}
        fn pose_update(&mut self, _time_ns: u64, _pose: &Pose, _slot_id: usize) {}
        fn prepare_delay_slot(&mut self, _time_ns: u64, _slot_id: usize) {}
        fn release_delay_slot(&mut self, _slot_id: usize) {}
        fn pose_at(&mut self, _time_ns: u64) -> FilterState {
            FilterState::default()
        }
        fn delay_slot_pose_at(&mut self, _time_ns: u64, _slot_id: usize) -> FilterState {
            FilterState::default()
        }
    }

    #[derive(Default)]
    struct RecordingSensor {
        exposures: Mutex<Vec<u16>>,
        poses: Mutex<Vec<Pose>>,
    }

    impl TrackerSensor for RecordingSensor {
        fn serial(&self) -> &str {
            "TEST0001"
        }
        fn on_new_device(&self, _device: &Arc<TrackedDevice>) -> bool {
            true
        }
        fn update_exposure(&self, info: &ExposureInfo) {
            self.exposures.lock().unwrap().push(info.count);
        }
        fn set_pose(&self, pose: &Pose) {
            self.poses.lock().unwrap().push(*pose);
        }
    }

    fn test_tracker() -> Tracker {
        Tracker::new(TrackerConfig::default()).expect("tracker init")
    }

    #[test]
    fn repeated_exposure_count_is_a_noop() {
        let tracker = test_tracker();
        let sensor = Arc::new(RecordingSensor::default());
        tracker.add_sensor(sensor.clone());

        tracker.on_new_exposure(1000, 10, 990, 1);
        tracker.on_new_exposure(2000, 10, 1990, 1);
        assert_eq!(*sensor.exposures.lock().unwrap(), vec![10]);

        tracker.on_new_exposure(3000, 11, 2990, 1);
        assert_eq!(*sensor.exposures.lock().unwrap(), vec![10, 11]);
    }

    #[test]
    fn exposure_info_unpublished_until_first_event() {
        let tracker = test_tracker();
        assert!(tracker.exposure_info().is_none());

        tracker.on_new_exposure(1000, 1, 990, 0);
        let info = tracker.exposure_info().expect("published");
        assert_eq!(info.count, 1);
        assert_eq!(info.hmd_ts, 990);
    }

    #[test]
    fn absent_devices_have_no_fusion_slot() {
        let tracker = test_tracker();
        tracker
            .add_device(
                0,
                &Pose::identity(),
                &Pose::identity(),
                Vec::new(),
                Box::new(NullFilter),
            )
            .unwrap();

        tracker.on_new_exposure(1000, 5, 990, 0);
        let info = tracker.exposure_info().unwrap();
        assert_eq!(info.n_devices, 1);
        for dev_info in &info.devices[1..] {
            assert_eq!(dev_info.fusion_slot, -1);
        }
    }

    #[test]
    fn device_table_is_bounded() {
        let tracker = test_tracker();
        for id in 0..MAX_TRACKED_DEVICES as i32 {
            tracker
                .add_device(
                    id,
                    &Pose::identity(),
                    &Pose::identity(),
                    Vec::new(),
                    Box::new(NullFilter),
                )
                .unwrap();
        }

        let overflow = tracker.add_device(
            99,
            &Pose::identity(),
            &Pose::identity(),
            Vec::new(),
            Box::new(NullFilter),
        );
        assert!(matches!(overflow, Err(TrackerError::TooManyDevices)));
    }

    #[test]
    fn frame_lifecycle_claims_and_releases_slots() {
        let tracker = test_tracker();
        let dev = tracker
            .add_device(
                0,
                &Pose::identity(),
                &Pose::identity(),
                Vec::new(),
                Box::new(NullFilter),
            )
            .unwrap();

        dev.imu_update(
            0,
            1_000_000,
            0.001,
            &Vector3::zeros(),
            &Vector3::zeros(),
            &Vector3::zeros(),
        );

        tracker.on_new_exposure(1000, 1, 990, 0);
        let mut info = tracker.exposure_info().unwrap();
        assert_eq!(info.devices[0].fusion_slot, 0);

        tracker.frame_start(10, "cam0", Some(&mut info));
        assert_eq!(info.devices[0].fusion_slot, 0);

        tracker.frame_captured(20, 10, &info, "cam0");

        tracker.frame_release(30, 10, Some(&mut info), "cam0");
        assert_eq!(info.devices[0].fusion_slot, -1);

        // Releasing again is harmless
        tracker.frame_release(40, 10, Some(&mut info), "cam0");
    }

    #[test]
    fn frame_changed_exposure_moves_the_claim() {
        let tracker = test_tracker();
        let dev = tracker
            .add_device(
                0,
                &Pose::identity(),
                &Pose::identity(),
                Vec::new(),
                Box::new(NullFilter),
            )
            .unwrap();

        dev.imu_update(
            0,
            1_000_000,
            0.001,
            &Vector3::zeros(),
            &Vector3::zeros(),
            &Vector3::zeros(),
        );

        tracker.on_new_exposure(1000, 1, 990, 0);
        let mut old_info = tracker.exposure_info().unwrap();
        tracker.frame_start(10, "cam0", Some(&mut old_info));

        dev.imu_update(
            0,
            1_001_000,
            0.001,
            &Vector3::zeros(),
            &Vector3::zeros(),
            &Vector3::zeros(),
        );
        tracker.on_new_exposure(2000, 2, 1990, 0);
        let mut new_info = tracker.exposure_info().unwrap();

        tracker.frame_changed_exposure(Some(&mut old_info), Some(&mut new_info));
        assert_eq!(old_info.devices[0].fusion_slot, -1);
        assert_ne!(new_info.devices[0].fusion_slot, -1);

        tracker.frame_release(30, 10, Some(&mut new_info), "cam0");
    }

    #[test]
    fn sensor_gets_calibrated_pose_with_room_offset() {
        let mut config = TrackerConfig::default();
        config.room_center_offset = Vector3::new(0.0, 1.0, 0.0);
        config.sensor_poses.insert(
            "TEST0001".to_string(),
            Pose::new(Vector3::new(1.0, 0.0, 0.0), nalgebra::UnitQuaternion::identity()),
        );

        let tracker = Tracker::new(config).unwrap();
        let sensor = Arc::new(RecordingSensor::default());
        tracker.add_sensor(sensor.clone());

        let poses = sensor.poses.lock().unwrap();
        assert_eq!(poses.len(), 1);
        assert_eq!(poses[0].pos, Vector3::new(1.0, 1.0, 0.0));
    }

    #[test]
    fn device_exposure_entry_identity_is_stable_across_frames() {
        let tracker = test_tracker();
        let dev = tracker
            .add_device(
                0,
                &Pose::identity(),
                &Pose::identity(),
                Vec::new(),
                Box::new(NullFilter),
            )
            .unwrap();

        dev.imu_update(
            0,
            1_000_000,
            0.001,
            &Vector3::zeros(),
            &Vector3::zeros(),
            &Vector3::zeros(),
        );

        tracker.on_new_exposure(1000, 1, 990, 0);
        let info = tracker.exposure_info().unwrap();

        // Two cameras capture frames for the same exposure
        let mut cam0: ExposureInfo = info;
        let mut cam1: ExposureInfo = info;
        tracker.frame_start(10, "cam0", Some(&mut cam0));
        tracker.frame_start(11, "cam1", Some(&mut cam1));

        let mut lookup: DeviceExposureInfo = cam0.devices[0];
        assert!(dev.latest_exposure_pose(&mut lookup));

        tracker.frame_release(20, 10, Some(&mut cam0), "cam0");
        // Slot stays valid while cam1 still holds it
        let mut lookup: DeviceExposureInfo = cam1.devices[0];
        assert!(dev.latest_exposure_pose(&mut lookup));

        tracker.frame_release(21, 11, Some(&mut cam1), "cam1");
        let mut lookup: DeviceExposureInfo = info.devices[0];
        assert!(!dev.latest_exposure_pose(&mut lookup));
    }
}
