//! The device descriptor returned by DESCRIBE_DEVICE: a fixed header followed by a
//! packed list of variable-length, self-describing device option records.
//!
//! Options advertise capabilities (queue formats, jumbo frames, buffer sizes, flow
//! steering). Unknown option ids are skipped silently; recognized options whose
//! length or required-features mask does not match expectations are skipped with a
//! warning, so that an older driver keeps working against a newer device. Walking
//! past the descriptor's `total_length`, on the other hand, means the descriptor is
//! corrupt and parsing fails outright.

use core::convert::TryFrom;
use core::mem::size_of;

use byteorder::BigEndian;
use num_enum::TryFromPrimitive;
use zerocopy::byteorder::{U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

/// Version of the descriptor layout this driver requests from the device.
pub const DEVICE_DESCRIPTOR_VERSION: u32 = 1;

/// The fixed descriptor header. Option records follow immediately after it.
#[derive(Debug, PartialEq, FromBytes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C)]
pub struct DeviceDescriptor {
    pub max_registered_pages: U64<BigEndian>,
    pub reserved1: U16<BigEndian>,
    pub tx_queue_entries: U16<BigEndian>,
    pub rx_queue_entries: U16<BigEndian>,
    pub default_num_queues: U16<BigEndian>,
    pub mtu: U16<BigEndian>,
    pub counters: U16<BigEndian>,
    pub tx_pages_per_qpl: U16<BigEndian>,
    pub rx_pages_per_qpl: U16<BigEndian>,
    pub mac: [u8; 6],
    pub num_device_options: U16<BigEndian>,
    pub total_length: U16<BigEndian>,
    pub reserved2: [u8; 6],
}
const_assert_eq!(size_of::<DeviceDescriptor>(), 40);

/// Header of one option record; `option_length` bytes of payload follow.
#[derive(FromBytes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C)]
pub struct DeviceOptionHeader {
    pub option_id: U16<BigEndian>,
    pub option_length: U16<BigEndian>,
    pub required_features_mask: U32<BigEndian>,
}
const_assert_eq!(size_of::<DeviceOptionHeader>(), 8);

/// Option ids this driver recognizes.
#[derive(Debug, PartialEq, Eq, Copy, Clone, TryFromPrimitive)]
#[repr(u16)]
pub enum DeviceOptionId {
    GqiRawAddressing = 0x1,
    GqiRda           = 0x2,
    GqiQpl           = 0x3,
    DqoRda           = 0x4,
    DqoQpl           = 0x7,
    JumboFrames      = 0x8,
    BufferSizes      = 0xA,
    FlowSteering     = 0xB,
}

// Every recognized option must advertise exactly this required-features mask;
// anything else belongs to a future driver generation and is ignored.
const REQUIRED_FEATURES_NONE: u32 = 0x0;

#[derive(Debug, PartialEq, FromBytes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C)]
pub struct GqiRdaOption {
    pub supported_features_mask: U32<BigEndian>,
}
const_assert_eq!(size_of::<GqiRdaOption>(), 4);

#[derive(Debug, PartialEq, FromBytes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C)]
pub struct GqiQplOption {
    pub supported_features_mask: U32<BigEndian>,
}
const_assert_eq!(size_of::<GqiQplOption>(), 4);

#[derive(Debug, PartialEq, FromBytes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C)]
pub struct DqoRdaOption {
    pub supported_features_mask: U32<BigEndian>,
    pub tx_comp_ring_entries: U16<BigEndian>,
    pub rx_buff_ring_entries: U16<BigEndian>,
}
const_assert_eq!(size_of::<DqoRdaOption>(), 8);

#[derive(Debug, PartialEq, FromBytes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C)]
pub struct DqoQplOption {
    pub supported_features_mask: U32<BigEndian>,
    pub tx_pages_per_qpl: U16<BigEndian>,
    pub rx_pages_per_qpl: U16<BigEndian>,
}
const_assert_eq!(size_of::<DqoQplOption>(), 8);

#[derive(Debug, PartialEq, FromBytes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C)]
pub struct JumboFramesOption {
    pub supported_features_mask: U32<BigEndian>,
    pub max_mtu: U16<BigEndian>,
    pub padding: [u8; 2],
}
const_assert_eq!(size_of::<JumboFramesOption>(), 8);

#[derive(Debug, PartialEq, FromBytes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C)]
pub struct BufferSizesOption {
    pub supported_features_mask: U32<BigEndian>,
    pub packet_buffer_size: U16<BigEndian>,
    pub header_buffer_size: U16<BigEndian>,
}
const_assert_eq!(size_of::<BufferSizesOption>(), 8);

#[derive(Debug, PartialEq, FromBytes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C)]
pub struct FlowSteeringOption {
    pub supported_features_mask: U32<BigEndian>,
    pub reserved: U16<BigEndian>,
    pub max_num_rules: U16<BigEndian>,
}
const_assert_eq!(size_of::<FlowSteeringOption>(), 8);

/// The recognized options extracted from one descriptor, at most one of each.
#[derive(Debug, PartialEq, Default)]
pub struct DeviceOptions {
    pub gqi_raw_addressing: bool,
    pub gqi_rda: Option<GqiRdaOption>,
    pub gqi_qpl: Option<GqiQplOption>,
    pub dqo_rda: Option<DqoRdaOption>,
    pub dqo_qpl: Option<DqoQplOption>,
    pub jumbo_frames: Option<JumboFramesOption>,
    pub buffer_sizes: Option<BufferSizesOption>,
    pub flow_steering: Option<FlowSteeringOption>,
}

/// Fatal descriptor parse failures. These abort device bring-up.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ParseError {
    /// The buffer is too small to hold the fixed descriptor header.
    HeaderTooShort,
    /// The descriptor claims a `total_length` beyond the snapshot buffer.
    TotalLengthTooLarge,
    /// Walking the advertised number of options ran past `total_length`.
    OptionsExceedTotalLength,
}

impl From<ParseError> for &'static str {
    fn from(error: ParseError) -> Self {
        match error {
            ParseError::HeaderTooShort => "device descriptor shorter than its fixed header",
            ParseError::TotalLengthTooLarge => {
                "device descriptor total_length exceeds the snapshot buffer"
            }
            ParseError::OptionsExceedTotalLength => {
                "device options exceed the descriptor's total length"
            }
        }
    }
}

/// Walks the option records following the descriptor header and extracts the
/// recognized, valid ones.
pub fn parse(bytes: &[u8]) -> Result<(DeviceDescriptor, DeviceOptions), ParseError> {
    let (header, _) =
        LayoutVerified::<_, DeviceDescriptor>::new_unaligned_from_prefix(bytes)
            .ok_or(ParseError::HeaderTooShort)?;
    let descriptor = *header;

    let total_length = descriptor.total_length.get() as usize;
    if total_length > bytes.len() {
        error!(
            "device descriptor total_length {} exceeds snapshot of {} bytes",
            total_length,
            bytes.len()
        );
        return Err(ParseError::TotalLengthTooLarge);
    }

    let mut options = DeviceOptions::default();
    let mut offset = size_of::<DeviceDescriptor>();
    for _ in 0..descriptor.num_device_options.get() {
        let payload_start = offset + size_of::<DeviceOptionHeader>();
        let option = bytes
            .get(offset..payload_start)
            .and_then(|raw| LayoutVerified::<_, DeviceOptionHeader>::new_unaligned(raw));
        let option = match option {
            Some(option) => *option,
            None => {
                error!("device options exceed the descriptor's total length");
                return Err(ParseError::OptionsExceedTotalLength);
            }
        };

        let record_end = payload_start + option.option_length.get() as usize;
        if record_end > total_length {
            error!("device options exceed the descriptor's total length");
            return Err(ParseError::OptionsExceedTotalLength);
        }

        parse_device_option(&option, &bytes[payload_start..record_end], &mut options);
        offset = record_end;
    }

    Ok((descriptor, options))
}

/// Validates one option record against its expected length and feature mask, and
/// stores the payload if it checks out. Mismatches are logged and skipped, never
/// fatal.
fn parse_device_option(
    header: &DeviceOptionHeader,
    payload: &[u8],
    options: &mut DeviceOptions,
) {
    let option_id = header.option_id.get();
    let id = match DeviceOptionId::try_from(option_id) {
        Ok(id) => id,
        Err(_) => {
            debug!("unrecognized device option {:#x} not enabled", option_id);
            return;
        }
    };

    match id {
        DeviceOptionId::GqiRawAddressing => {
            // The raw-addressing marker carries no payload at all.
            if header.option_length.get() != 0
                || header.required_features_mask.get() != REQUIRED_FEATURES_NONE
            {
                log_option_mismatch(id, 0, header);
                return;
            }
            info!("gqi raw addressing device option enabled");
            options.gqi_raw_addressing = true;
        }
        DeviceOptionId::GqiRda => {
            options.gqi_rda = extract_option(id, header, payload);
        }
        DeviceOptionId::GqiQpl => {
            options.gqi_qpl = extract_option(id, header, payload);
        }
        DeviceOptionId::DqoRda => {
            options.dqo_rda = extract_option(id, header, payload);
        }
        DeviceOptionId::DqoQpl => {
            options.dqo_qpl = extract_option(id, header, payload);
        }
        DeviceOptionId::JumboFrames => {
            options.jumbo_frames = extract_option(id, header, payload);
        }
        DeviceOptionId::BufferSizes => {
            options.buffer_sizes = extract_option(id, header, payload);
        }
        DeviceOptionId::FlowSteering => {
            options.flow_steering = extract_option(id, header, payload);
        }
    }
}

/// Decodes a fixed-layout option payload, tolerating oversized payloads from newer
/// devices and rejecting undersized or mask-mismatched ones.
fn extract_option<T>(
    id: DeviceOptionId,
    header: &DeviceOptionHeader,
    payload: &[u8],
) -> Option<T>
where
    T: FromBytes + Unaligned + Copy,
{
    let expected_length = size_of::<T>();
    let option_length = header.option_length.get() as usize;
    if option_length < expected_length
        || header.required_features_mask.get() != REQUIRED_FEATURES_NONE
    {
        log_option_mismatch(id, expected_length, header);
        return None;
    }
    if option_length > expected_length {
        warn!(
            "length of {:?} option larger than expected, possible older version of guest driver",
            id
        );
    }
    LayoutVerified::<_, T>::new_unaligned_from_prefix(payload)
        .map(|(option, _)| *option)
}

fn log_option_mismatch(id: DeviceOptionId, expected_length: usize, header: &DeviceOptionHeader) {
    warn!(
        "{:?} option error: expected length={} feature_mask={:#x}, actual length={} feature_mask={:#x}",
        id,
        expected_length,
        REQUIRED_FEATURES_NONE,
        header.option_length.get(),
        header.required_features_mask.get(),
    );
}
