use crate::error::TrackerError;
use crate::frame::{FramePool, VideoFrame};
use crate::profile::{SensorVariant, SENSOR_CLOCK_FREQ};
use crate::types::HostClock;
use crate::uvc::{
    self, PayloadHeader, PayloadHeaderFlags, ProbeCommitControl, ISO_ENDPOINT, CONTROL_IFACE,
    VIDEO_IFACE,
};
use crate::Result;
use crossbeam_channel::{Receiver, TrySendError};
use rusb::ffi;
use std::os::raw::{c_int, c_uint, c_void};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Receives each completed video frame, on the USB event thread. The sink
/// owns the frame until it hands it back via [`FramePool::release`].
pub type FrameSink = Box<dyn FnMut(VideoFrame) + Send>;

const SUBMIT_RETRIES: usize = 5;
const SUBMIT_RETRY_SLEEP: Duration = Duration::from_micros(500);
const TRANSFER_TIMEOUT_MS: c_uint = 1000;

/// Per-stream UVC payload reassembly state.
///
/// Fed isochronous payloads in arrival order; emits completed frames to
/// the sink. Only ever touched from the USB event thread.
struct Assembler {
    pool: Arc<FramePool>,
    clock: HostClock,
    sink: FrameSink,
    frame_size: usize,
    stride: u32,
    width: u32,
    height: u32,
    cur_frame: Option<VideoFrame>,
    /// Parity bit of the frame currently being collected. `None` until
    /// the first payload arrives, so the first payload always starts a
    /// frame regardless of its parity.
    frame_id: Option<u8>,
    cur_pts: u32,
    frame_collected: usize,
    skip_frame: bool,
}

impl Assembler {
    fn new(
        pool: Arc<FramePool>,
        clock: HostClock,
        stride: u32,
        width: u32,
        height: u32,
        sink: FrameSink,
    ) -> Assembler {
        Assembler {
            frame_size: pool.frame_size(),
            pool,
            clock,
            sink,
            stride,
            width,
            height,
            cur_frame: None,
            frame_id: None,
            cur_pts: 0,
            frame_collected: 0,
            skip_frame: false,
        }
    }

    /// Process one isochronous payload (UVC header + pixel data).
    fn process_payload(&mut self, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }
        // Header-only payloads carry no pixel data.
        if payload.len() == PayloadHeader::SIZE {
            return;
        }

        let header = match PayloadHeader::parse(payload) {
            Some(h) if h.len as usize == PayloadHeader::SIZE => h,
            _ => {
                log::warn!(
                    "invalid payload header: len {}/{}",
                    payload.first().copied().unwrap_or(0),
                    payload.len()
                );
                return;
            }
        };

        if header.flags.contains(PayloadHeaderFlags::ERROR) {
            log::warn!("UVC frame error");
            return;
        }

        let mut pts = u32::MAX;
        if header.flags.contains(PayloadHeaderFlags::HAS_PTS) {
            pts = header.pts;
            if self.frame_collected != 0 && pts != self.cur_pts {
                log::warn!(
                    "UVC PTS changed in-frame at {} bytes. Lost {} ms",
                    self.frame_collected,
                    pts.wrapping_sub(self.cur_pts.wrapping_mul(1000)) / SENSOR_CLOCK_FREQ
                );
                self.cur_pts = pts;
            }
        }

        if self.frame_id != Some(header.frame_id()) {
            // Start of a new camera frame
            if self.frame_collected > 0 {
                log::warn!(
                    "UVC dropping short frame: {} < {} ({} lost)",
                    self.frame_collected,
                    self.frame_size,
                    self.frame_size - self.frame_collected
                );
            }

            let time = self.clock.now_ns();

            if self.cur_frame.is_none() {
                self.cur_frame = self.pool.try_acquire();
            }

            self.frame_id = Some(header.frame_id());
            self.cur_pts = pts;
            self.frame_collected = 0;
            self.skip_frame = false;

            if self.cur_frame.is_none() {
                log::warn!("No frame available for pixel data. Skipping frame");
                self.skip_frame = true;
            }

            if let Some(frame) = self.cur_frame.as_mut() {
                debug_assert_eq!(frame.data_size, self.frame_size);
                frame.start_ts = time;
                frame.pts = pts;
                frame.stride = self.stride;
                frame.width = self.width;
                frame.height = self.height;
            }
        }

        if self.skip_frame || self.cur_frame.is_none() {
            return;
        }

        let body = &payload[PayloadHeader::SIZE..];
        if self.frame_collected + body.len() > self.frame_size {
            log::warn!(
                "UVC frame buffer overflow: {} + {} > {}",
                self.frame_collected,
                body.len(),
                self.frame_size
            );
            return;
        }

        if let Some(frame) = self.cur_frame.as_mut() {
            frame.data[self.frame_collected..self.frame_collected + body.len()]
                .copy_from_slice(body);
            self.frame_collected += body.len();
        }

        if self.frame_collected == self.frame_size {
            if let Some(frame) = self.cur_frame.take() {
                (self.sink)(frame);
            }
            self.frame_collected = 0;
        }

        if header.flags.contains(PayloadHeaderFlags::END_OF_FRAME) {
            // Always restart a frame after EOF. The CV1 sensor never sets
            // this bit, but others might.
            self.frame_collected = 0;
        }
    }
}

/// State shared between the stream handle and the transfer callbacks.
struct StreamShared {
    assembler: Mutex<Option<Assembler>>,
    video_running: AtomicBool,
    active_transfers: Mutex<usize>,
    drained: Condvar,
    packet_size: usize,
}

impl StreamShared {
    fn retire_transfer(&self) {
        let mut active = self.active_transfers.lock().unwrap();
        *active = active.saturating_sub(1);
        if *active == 0 {
            self.drained.notify_all();
        }
    }
}

/// One allocated isochronous transfer and its buffer.
///
/// The buffer is a separate heap allocation that must not move or be
/// freed while the transfer may still be submitted; it lives exactly as
/// long as the libusb transfer it is registered with.
struct IsoTransfer {
    xfer: *mut ffi::libusb_transfer,
    _buf: Box<[u8]>,
}

// The raw transfer pointer is only touched from the submitting thread and
// the USB event thread, never concurrently: libusb owns it between submit
// and completion, we own it otherwise.
unsafe impl Send for IsoTransfer {}

impl Drop for IsoTransfer {
    fn drop(&mut self) {
        unsafe { ffi::libusb_free_transfer(self.xfer) };
    }
}

extern "system" fn iso_transfer_cb(xfer: *mut ffi::libusb_transfer) {
    // user_data points at the StreamShared owned by the UvcStream, which
    // outlives all transfer activity (stop() drains before teardown).
    let shared = unsafe { &*((*xfer).user_data as *const StreamShared) };
    let status = unsafe { (*xfer).status };

    if status != ffi::constants::LIBUSB_TRANSFER_COMPLETED {
        if status != ffi::constants::LIBUSB_TRANSFER_CANCELLED {
            log::warn!("transfer error: {}", status);
        }
        shared.retire_transfer();
        return;
    }

    if !shared.video_running.load(Ordering::Acquire) {
        // Not resubmitting; reduce the transfer count
        shared.retire_transfer();
        return;
    }

    let num_packets = unsafe { (*xfer).num_iso_packets } as usize;
    {
        let mut guard = shared.assembler.lock().unwrap();
        if let Some(assembler) = guard.as_mut() {
            for i in 0..num_packets {
                let desc = unsafe { &*(*xfer).iso_packet_desc.as_ptr().add(i) };
                let payload = unsafe {
                    std::slice::from_raw_parts(
                        (*xfer).buffer.add(i * shared.packet_size),
                        desc.actual_length as usize,
                    )
                };
                assembler.process_payload(payload);
            }
        }
    }

    // Resubmission sometimes fails transiently; retry briefly before
    // retiring the transfer and letting the stream run degraded.
    let mut ret: c_int = 0;
    let mut attempts = 0;
    for i in 0..SUBMIT_RETRIES {
        attempts = i;
        ret = unsafe { ffi::libusb_submit_transfer(xfer) };
        if ret >= 0 {
            break;
        }
        std::thread::sleep(SUBMIT_RETRY_SLEEP);
    }

    if ret < 0 {
        log::error!(
            "failed to resubmit isochronous transfer after {} attempts: {}",
            SUBMIT_RETRIES,
            ret
        );
        shared.retire_transfer();
    } else if attempts > 0 {
        log::info!("resubmitted isochronous transfer after {} attempts", attempts + 1);
    }
}

fn libusb_error(code: c_int) -> rusb::Error {
    match code {
        ffi::constants::LIBUSB_ERROR_IO => rusb::Error::Io,
        ffi::constants::LIBUSB_ERROR_INVALID_PARAM => rusb::Error::InvalidParam,
        ffi::constants::LIBUSB_ERROR_ACCESS => rusb::Error::Access,
        ffi::constants::LIBUSB_ERROR_NO_DEVICE => rusb::Error::NoDevice,
        ffi::constants::LIBUSB_ERROR_NOT_FOUND => rusb::Error::NotFound,
        ffi::constants::LIBUSB_ERROR_BUSY => rusb::Error::Busy,
        ffi::constants::LIBUSB_ERROR_TIMEOUT => rusb::Error::Timeout,
        ffi::constants::LIBUSB_ERROR_OVERFLOW => rusb::Error::Overflow,
        ffi::constants::LIBUSB_ERROR_PIPE => rusb::Error::Pipe,
        ffi::constants::LIBUSB_ERROR_INTERRUPTED => rusb::Error::Interrupted,
        ffi::constants::LIBUSB_ERROR_NO_MEM => rusb::Error::NoMem,
        ffi::constants::LIBUSB_ERROR_NOT_SUPPORTED => rusb::Error::NotSupported,
        _ => rusb::Error::Other,
    }
}

/// An open, negotiated UVC video stream on one constellation sensor.
///
/// `setup` claims the interfaces, runs the probe/commit negotiation and
/// allocates the transfer ring; `start` begins capture into a fresh frame
/// pool. Completion callbacks run on the tracker's USB event thread, so a
/// stream only makes progress while that thread is pumping events.
pub struct UvcStream {
    // Field order matters on drop: transfers reference `shared` through
    // their user_data pointers and must go first.
    transfers: Vec<IsoTransfer>,
    shared: Arc<StreamShared>,
    devh: rusb::DeviceHandle<rusb::Context>,
    variant: SensorVariant,
    negotiated: ProbeCommitControl,
    pool: Option<Arc<FramePool>>,
    clock: HostClock,
}

impl UvcStream {
    /// Claim the sensor's interfaces, negotiate streaming parameters and
    /// prepare the isochronous transfer ring. The sensor variant is taken
    /// from the device descriptor's product ID.
    pub fn setup(mut devh: rusb::DeviceHandle<rusb::Context>, clock: HostClock) -> Result<UvcStream> {
        let desc = devh.device().device_descriptor()?;
        let variant = SensorVariant::from_product_id(desc.product_id())
            .ok_or(TrackerError::UnknownSensor(desc.product_id()))?;

        devh.set_auto_detach_kernel_driver(true)?;
        devh.claim_interface(CONTROL_IFACE)?;
        devh.claim_interface(VIDEO_IFACE)?;

        if variant.needs_esp570_init() {
            uvc::esp570_setup_unknown_3(&devh)?;
        }

        let negotiated = uvc::negotiate(&devh, variant)?;
        log::info!(
            "negotiated {:?} stream: {}x{} interval {} payload {}",
            variant,
            variant.width(),
            variant.height(),
            negotiated.frame_interval,
            negotiated.max_payload_transfer_size
        );

        devh.set_alternate_setting(VIDEO_IFACE, variant.alt_setting())?;

        let (num_transfers, num_packets) = variant.iso_layout();
        let packet_size = variant.packet_size();

        let shared = Arc::new(StreamShared {
            assembler: Mutex::new(None),
            video_running: AtomicBool::new(false),
            active_transfers: Mutex::new(0),
            drained: Condvar::new(),
            packet_size,
        });

        let user_data = Arc::as_ptr(&shared) as *mut c_void;
        let mut transfers = Vec::with_capacity(num_transfers);
        for _ in 0..num_transfers {
            let xfer = unsafe { ffi::libusb_alloc_transfer(num_packets as c_int) };
            if xfer.is_null() {
                return Err(TrackerError::TransferAlloc);
            }

            let mut buf = vec![0u8; num_packets * packet_size].into_boxed_slice();
            unsafe {
                (*xfer).dev_handle = devh.as_raw();
                (*xfer).endpoint = ISO_ENDPOINT;
                (*xfer).transfer_type = ffi::constants::LIBUSB_TRANSFER_TYPE_ISOCHRONOUS;
                (*xfer).timeout = TRANSFER_TIMEOUT_MS;
                (*xfer).buffer = buf.as_mut_ptr();
                (*xfer).length = buf.len() as c_int;
                (*xfer).num_iso_packets = num_packets as c_int;
                (*xfer).callback = iso_transfer_cb;
                (*xfer).user_data = user_data;

                let descs = (*xfer).iso_packet_desc.as_mut_ptr();
                for i in 0..num_packets {
                    (*descs.add(i)).length = packet_size as c_uint;
                }
            }

            transfers.push(IsoTransfer { xfer, _buf: buf });
        }

        Ok(UvcStream {
            transfers,
            shared,
            devh,
            variant,
            negotiated,
            pool: None,
            clock,
        })
    }

    pub fn variant(&self) -> SensorVariant {
        self.variant
    }

    pub fn negotiated(&self) -> &ProbeCommitControl {
        &self.negotiated
    }

    /// The stream's frame pool, available while capture is running.
    /// Consumers release frames back through it.
    pub fn pool(&self) -> Option<Arc<FramePool>> {
        self.pool.clone()
    }

    /// Control-path access to the sensor's USB handle, for callers that
    /// need to talk to the camera outside the video stream.
    pub fn device_handle(&mut self) -> &mut rusb::DeviceHandle<rusb::Context> {
        &mut self.devh
    }

    /// Begin capture with `min_frames` pre-allocated frame buffers,
    /// delivering completed frames to `sink`.
    pub fn start(&mut self, min_frames: usize, sink: FrameSink) -> Result<()> {
        let v = self.variant;
        let pool = FramePool::new(min_frames, v.frame_size(), v.stride(), v.width(), v.height());
        self.start_with_pool(pool, sink)
    }

    /// Begin capture, delivering frames through a bounded channel. Frames
    /// that would overflow the channel are dropped straight back into the
    /// pool rather than blocking the USB event thread.
    pub fn start_channel(&mut self, min_frames: usize) -> Result<Receiver<VideoFrame>> {
        let v = self.variant;
        let pool = FramePool::new(min_frames, v.frame_size(), v.stride(), v.width(), v.height());

        let (sender, receiver) = crossbeam_channel::bounded(min_frames);
        let release_pool = pool.clone();
        let sink: FrameSink = Box::new(move |frame| match sender.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                log::trace!("frame channel full, dropping frame");
                release_pool.release(frame);
            }
            Err(TrySendError::Disconnected(frame)) => {
                log::trace!("frame channel disconnected, dropping frame");
                release_pool.release(frame);
            }
        });

        self.start_with_pool(pool, sink)?;
        Ok(receiver)
    }

    fn start_with_pool(&mut self, pool: Arc<FramePool>, sink: FrameSink) -> Result<()> {
        if self.shared.video_running.swap(true, Ordering::AcqRel) {
            return Err(TrackerError::StreamRunning);
        }

        let v = self.variant;
        *self.shared.assembler.lock().unwrap() = Some(Assembler::new(
            pool.clone(),
            self.clock,
            v.stride(),
            v.width(),
            v.height(),
            sink,
        ));
        self.pool = Some(pool);

        for i in 0..self.transfers.len() {
            let ret = unsafe { ffi::libusb_submit_transfer(self.transfers[i].xfer) };
            if ret < 0 {
                log::error!("failed to submit iso transfer {}: {}", i, ret);
                *self.shared.active_transfers.lock().unwrap() = i;
                let _ = self.stop();
                return Err(TrackerError::Usb(libusb_error(ret)));
            }
        }

        *self.shared.active_transfers.lock().unwrap() = self.transfers.len();
        Ok(())
    }

    /// Stop capture: drop to alt-setting 0, stop resubmitting, and wait
    /// for all in-flight transfers to retire. Requires the USB event
    /// thread to keep pumping until the drain completes.
    pub fn stop(&mut self) -> Result<()> {
        if !self.shared.video_running.load(Ordering::Acquire) {
            return Err(TrackerError::StreamNotRunning);
        }

        self.devh.set_alternate_setting(VIDEO_IFACE, 0)?;
        self.shared.video_running.store(false, Ordering::Release);

        let mut active = self.shared.active_transfers.lock().unwrap();
        while *active > 0 {
            let (guard, timeout) = self
                .shared
                .drained
                .wait_timeout(active, Duration::from_secs(1))
                .unwrap();
            active = guard;
            if timeout.timed_out() && *active > 0 {
                log::warn!("still waiting for {} active transfers to retire", *active);
            }
        }
        drop(active);

        *self.shared.assembler.lock().unwrap() = None;
        self.pool = None;
        Ok(())
    }
}

impl Drop for UvcStream {
    fn drop(&mut self) {
        if self.shared.video_running.load(Ordering::Acquire) {
            if let Err(e) = self.stop() {
                log::warn!("failed to stop video stream on drop: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const TEST_PTS: u32 = 1000;

    fn collector() -> (Arc<Mutex<Vec<VideoFrame>>>, FrameSink) {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink_frames = frames.clone();
        let sink: FrameSink = Box::new(move |frame| sink_frames.lock().unwrap().push(frame));
        (frames, sink)
    }

    fn cv1_assembler(pool: &Arc<FramePool>, sink: FrameSink) -> Assembler {
        Assembler::new(pool.clone(), HostClock::new(), 1280, 1280, 960, sink)
    }

    fn cv1_pool(n: usize) -> Arc<FramePool> {
        FramePool::new(n, 1_228_800, 1280, 1280, 960)
    }

    fn payload(frame_id: u8, pts: Option<u32>, error: bool, eof: bool, body_len: usize) -> Vec<u8> {
        let mut flags = frame_id & 0x01;
        if pts.is_some() {
            flags |= 0x04;
        }
        if eof {
            flags |= 0x02;
        }
        if error {
            flags |= 0x40;
        }

        let mut buf = vec![0u8; PayloadHeader::SIZE + body_len];
        buf[0] = 12;
        buf[1] = flags;
        buf[2..6].copy_from_slice(&pts.unwrap_or(0).to_le_bytes());
        for (i, b) in buf[PayloadHeader::SIZE..].iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        buf
    }

    #[test]
    fn clean_frame_delivery() {
        let pool = cv1_pool(2);
        let (frames, sink) = collector();
        let mut asm = cv1_assembler(&pool, sink);

        // 400 payloads of 3072 bytes fill one 1228800-byte frame
        for _ in 0..400 {
            asm.process_payload(&payload(0, Some(TEST_PTS), false, false, 3072));
        }

        let delivered = frames.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].data_size, 1_228_800);
        assert_eq!(delivered[0].pts, TEST_PTS);
        assert_eq!(asm.frame_collected, 0);
        assert!(asm.cur_frame.is_none());
        drop(delivered);

        // Next parity starts a fresh frame cycle
        asm.process_payload(&payload(1, Some(TEST_PTS + 8), false, false, 3072));
        assert_eq!(asm.frame_collected, 3072);
        assert!(asm.cur_frame.is_some());
    }

    #[test]
    fn short_frame_is_dropped_and_new_frame_started() {
        let pool = cv1_pool(2);
        let (frames, sink) = collector();
        let mut asm = cv1_assembler(&pool, sink);

        for _ in 0..100 {
            asm.process_payload(&payload(0, Some(TEST_PTS), false, false, 3072));
        }
        assert_eq!(asm.frame_collected, 100 * 3072);

        // Parity flips before the frame completes
        asm.process_payload(&payload(1, Some(TEST_PTS + 8), false, false, 3072));

        assert_eq!(frames.lock().unwrap().len(), 0);
        assert_eq!(asm.frame_collected, 3072);
        assert_eq!(asm.cur_pts, TEST_PTS + 8);
    }

    #[test]
    fn mid_frame_pts_change_is_adopted() {
        let pool = cv1_pool(2);
        let (frames, sink) = collector();
        let mut asm = cv1_assembler(&pool, sink);

        asm.process_payload(&payload(0, Some(1000), false, false, 3072));
        assert_eq!(asm.cur_pts, 1000);

        asm.process_payload(&payload(0, Some(1002), false, false, 3072));
        assert_eq!(asm.cur_pts, 1002);
        // The frame keeps collecting
        assert_eq!(asm.frame_collected, 2 * 3072);
        assert_eq!(frames.lock().unwrap().len(), 0);
    }

    #[test]
    fn header_only_payload_is_ignored() {
        let pool = cv1_pool(1);
        let (_, sink) = collector();
        let mut asm = cv1_assembler(&pool, sink);

        asm.process_payload(&payload(0, None, false, false, 0));
        assert_eq!(asm.frame_collected, 0);
        assert!(asm.cur_frame.is_none());
    }

    #[test]
    fn empty_payload_is_ignored() {
        let pool = cv1_pool(1);
        let (_, sink) = collector();
        let mut asm = cv1_assembler(&pool, sink);
        asm.process_payload(&[]);
        assert!(asm.cur_frame.is_none());
    }

    #[test]
    fn error_payload_is_ignored_in_full() {
        let pool = cv1_pool(1);
        let (_, sink) = collector();
        let mut asm = cv1_assembler(&pool, sink);

        asm.process_payload(&payload(0, Some(TEST_PTS), true, false, 3072));
        assert_eq!(asm.frame_collected, 0);
        assert!(asm.cur_frame.is_none());
    }

    #[test]
    fn bad_header_length_is_rejected() {
        let pool = cv1_pool(1);
        let (_, sink) = collector();
        let mut asm = cv1_assembler(&pool, sink);

        let mut buf = payload(0, Some(TEST_PTS), false, false, 3072);
        buf[0] = 8;
        asm.process_payload(&buf);
        assert_eq!(asm.frame_collected, 0);
    }

    #[test]
    fn overflow_payload_is_dropped() {
        let pool = FramePool::new(1, 1024, 256, 256, 4);
        let (frames, sink) = collector();
        let mut asm = Assembler::new(pool, HostClock::new(), 256, 256, 4, sink);

        asm.process_payload(&payload(0, None, false, false, 1000));
        assert_eq!(asm.frame_collected, 1000);

        // 1000 + 100 > 1024: dropped, collected unchanged
        asm.process_payload(&payload(0, None, false, false, 100));
        assert_eq!(asm.frame_collected, 1000);
        assert_eq!(frames.lock().unwrap().len(), 0);
    }

    #[test]
    fn pool_underflow_skips_frame_until_next_parity_flip() {
        let pool = cv1_pool(1);
        let stolen = pool.try_acquire().unwrap();
        let (frames, sink) = collector();
        let mut asm = cv1_assembler(&pool, sink);

        asm.process_payload(&payload(0, Some(TEST_PTS), false, false, 3072));
        assert!(asm.skip_frame);
        assert_eq!(asm.frame_collected, 0);

        // Still skipping within the same frame
        asm.process_payload(&payload(0, Some(TEST_PTS), false, false, 3072));
        assert_eq!(asm.frame_collected, 0);

        // Frame returns to the pool; next parity flip recovers
        pool.release(stolen);
        asm.process_payload(&payload(1, Some(TEST_PTS + 8), false, false, 3072));
        assert!(!asm.skip_frame);
        assert_eq!(asm.frame_collected, 3072);
        assert_eq!(frames.lock().unwrap().len(), 0);
    }

    #[test]
    fn eof_resets_collection() {
        let pool = cv1_pool(1);
        let (_, sink) = collector();
        let mut asm = cv1_assembler(&pool, sink);

        asm.process_payload(&payload(0, Some(TEST_PTS), false, true, 3072));
        assert_eq!(asm.frame_collected, 0);
        // Buffer is retained for the restarted frame
        assert!(asm.cur_frame.is_some());
    }
}
