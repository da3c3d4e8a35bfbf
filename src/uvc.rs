use crate::error::TrackerError;
use crate::profile::SensorVariant;
use crate::Result;
use rusb::{DeviceHandle, UsbContext};
use std::time::Duration;

// -- UVC class requests --
const SET_CUR: u8 = 0x01;
const GET_CUR: u8 = 0x81;

// -- Video streaming interface control selectors --
const VS_PROBE_CONTROL: u8 = 1;
const VS_COMMIT_CONTROL: u8 = 2;

/// Interface 0 carries the camera controls, interface 1 the video stream.
pub const CONTROL_IFACE: u8 = 0;
pub const VIDEO_IFACE: u8 = 1;
/// Isochronous IN endpoint delivering video payloads.
pub const ISO_ENDPOINT: u8 = 0x81;

/// Extension unit of the sensor's ESP570 USB bridge.
const ESP570_EXTENSION_UNIT: u8 = 4;

const TIMEOUT: Duration = Duration::from_millis(1000);

// bmRequestType: class request to an interface, host-to-device / device-to-host.
const REQ_TYPE_CLASS_IFACE_OUT: u8 = 0x21;
const REQ_TYPE_CLASS_IFACE_IN: u8 = 0xa1;

/// UVC probe/commit video streaming parameter block, 31 bytes packed
/// little-endian on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeCommitControl {
    pub bm_hint: u16,
    pub format_index: u8,
    pub frame_index: u8,
    pub frame_interval: u32,
    pub key_frame_rate: u16,
    pub p_frame_rate: u16,
    pub comp_quality: u16,
    pub comp_window_size: u16,
    pub delay: u16,
    pub max_video_frame_size: u32,
    pub max_payload_transfer_size: u32,
    pub clock_frequency: u32,
    pub framing_info: u8,
}

impl ProbeCommitControl {
    pub const SIZE: usize = 31;

    /// Initial request for a sensor variant, before negotiation.
    pub fn for_variant(variant: SensorVariant) -> ProbeCommitControl {
        ProbeCommitControl {
            format_index: 1,
            frame_index: variant.frame_index(),
            frame_interval: variant.frame_interval(),
            max_video_frame_size: variant.frame_size() as u32,
            max_payload_transfer_size: variant.max_payload_transfer_size(),
            clock_frequency: variant.clock_frequency().unwrap_or(0),
            ..ProbeCommitControl::default()
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.bm_hint.to_le_bytes());
        buf[2] = self.format_index;
        buf[3] = self.frame_index;
        buf[4..8].copy_from_slice(&self.frame_interval.to_le_bytes());
        buf[8..10].copy_from_slice(&self.key_frame_rate.to_le_bytes());
        buf[10..12].copy_from_slice(&self.p_frame_rate.to_le_bytes());
        buf[12..14].copy_from_slice(&self.comp_quality.to_le_bytes());
        buf[14..16].copy_from_slice(&self.comp_window_size.to_le_bytes());
        buf[16..18].copy_from_slice(&self.delay.to_le_bytes());
        buf[18..22].copy_from_slice(&self.max_video_frame_size.to_le_bytes());
        buf[22..26].copy_from_slice(&self.max_payload_transfer_size.to_le_bytes());
        buf[26..30].copy_from_slice(&self.clock_frequency.to_le_bytes());
        buf[30] = self.framing_info;
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE]) -> ProbeCommitControl {
        ProbeCommitControl {
            bm_hint: u16::from_le_bytes([buf[0], buf[1]]),
            format_index: buf[2],
            frame_index: buf[3],
            frame_interval: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            key_frame_rate: u16::from_le_bytes([buf[8], buf[9]]),
            p_frame_rate: u16::from_le_bytes([buf[10], buf[11]]),
            comp_quality: u16::from_le_bytes([buf[12], buf[13]]),
            comp_window_size: u16::from_le_bytes([buf[14], buf[15]]),
            delay: u16::from_le_bytes([buf[16], buf[17]]),
            max_video_frame_size: u32::from_le_bytes([buf[18], buf[19], buf[20], buf[21]]),
            max_payload_transfer_size: u32::from_le_bytes([buf[22], buf[23], buf[24], buf[25]]),
            clock_frequency: u32::from_le_bytes([buf[26], buf[27], buf[28], buf[29]]),
            framing_info: buf[30],
        }
    }
}

bitflags::bitflags! {
    /// `bmHeaderInfo` bits of the UVC payload header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PayloadHeaderFlags: u8 {
        /// Toggles between 0 and 1 on each new camera frame.
        const FRAME_ID = 0x01;
        const END_OF_FRAME = 0x02;
        const HAS_PTS = 0x04;
        const HAS_SCR = 0x08;
        const ERROR = 0x40;
    }
}

/// Parsed 12-byte UVC payload header.
#[derive(Debug, Clone, Copy)]
pub struct PayloadHeader {
    pub len: u8,
    pub flags: PayloadHeaderFlags,
    pub pts: u32,
    pub sof_counter: u16,
    pub scr: u32,
}

impl PayloadHeader {
    pub const SIZE: usize = 12;

    /// Parse the header at the start of `payload`. Returns `None` for
    /// payloads too short to carry one.
    pub fn parse(payload: &[u8]) -> Option<PayloadHeader> {
        if payload.len() < Self::SIZE {
            return None;
        }
        Some(PayloadHeader {
            len: payload[0],
            flags: PayloadHeaderFlags::from_bits_truncate(payload[1]),
            pts: u32::from_le_bytes([payload[2], payload[3], payload[4], payload[5]]),
            sof_counter: u16::from_le_bytes([payload[6], payload[7]]),
            scr: u32::from_le_bytes([payload[8], payload[9], payload[10], payload[11]]),
        })
    }

    pub fn frame_id(&self) -> u8 {
        (self.flags & PayloadHeaderFlags::FRAME_ID).bits()
    }
}

/// UVC SET_CUR class transfer to a streaming/control interface selector.
pub fn set_cur<T: UsbContext>(
    devh: &DeviceHandle<T>,
    interface: u8,
    entity: u8,
    selector: u8,
    data: &[u8],
) -> Result<()> {
    let written = devh.write_control(
        REQ_TYPE_CLASS_IFACE_OUT,
        SET_CUR,
        (selector as u16) << 8,
        ((entity as u16) << 8) | interface as u16,
        data,
        TIMEOUT,
    )?;
    if written != data.len() {
        return Err(TrackerError::ShortControlResponse {
            got: written,
            expected: data.len(),
        });
    }
    Ok(())
}

/// UVC GET_CUR class transfer from a streaming/control interface selector.
pub fn get_cur<T: UsbContext>(
    devh: &DeviceHandle<T>,
    interface: u8,
    entity: u8,
    selector: u8,
    data: &mut [u8],
) -> Result<usize> {
    let read = devh.read_control(
        REQ_TYPE_CLASS_IFACE_IN,
        GET_CUR,
        (selector as u16) << 8,
        ((entity as u16) << 8) | interface as u16,
        data,
        TIMEOUT,
    )?;
    Ok(read)
}

/// ESP570 bridge init used by the DK2 sensor before stream negotiation.
///
/// Reads extension unit selector 3 twice. The response contents are not
/// interpreted; the read itself arms the bridge for streaming.
pub fn esp570_setup_unknown_3<T: UsbContext>(devh: &DeviceHandle<T>) -> Result<()> {
    let mut buf = [0u8; 2];
    get_cur(devh, CONTROL_IFACE, ESP570_EXTENSION_UNIT, 3, &mut buf)?;
    get_cur(devh, CONTROL_IFACE, ESP570_EXTENSION_UNIT, 3, &mut buf)?;
    Ok(())
}

/// Run the PROBE → GET → COMMIT negotiation for `variant` on the video
/// streaming interface and return the device's negotiated parameters.
pub fn negotiate<T: UsbContext>(
    devh: &DeviceHandle<T>,
    variant: SensorVariant,
) -> Result<ProbeCommitControl> {
    let request = ProbeCommitControl::for_variant(variant);

    set_cur(
        devh,
        VIDEO_IFACE,
        0,
        VS_PROBE_CONTROL,
        &request.to_bytes(),
    )?;

    let mut buf = [0u8; ProbeCommitControl::SIZE];
    let read = get_cur(devh, VIDEO_IFACE, 0, VS_PROBE_CONTROL, &mut buf)?;
    if read < ProbeCommitControl::SIZE {
        log::warn!("failed to get PROBE ({} bytes)", read);
        return Err(TrackerError::Negotiation("short PROBE response"));
    }
    let negotiated = ProbeCommitControl::from_bytes(&buf);

    set_cur(devh, VIDEO_IFACE, 0, VS_COMMIT_CONTROL, &buf)?;

    Ok(negotiated)
}
