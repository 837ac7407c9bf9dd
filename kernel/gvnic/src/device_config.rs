//! Capability negotiation: turning a parsed device descriptor and its extracted
//! options into the driver-wide configuration.
//!
//! The queue format is chosen in strict priority order and only the winning
//! format's supported-features mask gates the optional features. The whole
//! configuration is re-derived from scratch on every describe, e.g. after a reset.

use crate::device_descriptor::{DeviceDescriptor, DeviceOptions};
use crate::hal::PAGE_SIZE;

/// Queue descriptor formats, as encoded on the wire in
/// CONFIGURE_DEVICE_RESOURCES.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[repr(u8)]
pub enum QueueFormat {
    Unspecified = 0,
    GqiRda      = 1,
    GqiQpl      = 2,
    DqoRda      = 3,
    DqoQpl      = 4,
}

impl QueueFormat {
    /// True for the classic ring layout (as opposed to the descriptor-queue one).
    pub fn is_gqi(&self) -> bool {
        matches!(self, QueueFormat::GqiRda | QueueFormat::GqiQpl)
    }
}

bitflags! {
    /// Feature bits a queue-format option advertises in its
    /// `supported_features_mask`.
    pub struct SupportedFeatures: u32 {
        const MODIFY_RING   = 1 << 0;
        const JUMBO_FRAMES  = 1 << 2;
        const BUFFER_SIZES  = 1 << 4;
        const FLOW_STEERING = 1 << 5;
    }
}

/// Queue page list id that stands for raw (per-descriptor) DMA addressing.
pub const RAW_ADDRESSING_QPL_ID: u32 = 0xFFFF_FFFF;

/// Minimum Ethernet MTU; a device advertising less is broken.
pub const MIN_MTU: u16 = 68;

/// Byte size of one transmit descriptor in the classic ring layout.
const GQI_TX_DESC_SIZE: usize = 16;
/// Byte size of one receive descriptor in the classic ring layout.
const GQI_RX_DESC_SIZE: usize = 32;

const DEFAULT_PACKET_BUFFER_SIZE: u16 = 2048;
const MIN_PACKET_BUFFER_SIZE: u16 = 2048;
const MAX_PACKET_BUFFER_SIZE: u16 = 4096;

const DEFAULT_HEADER_BUFFER_SIZE: u16 = 128;
const MIN_HEADER_BUFFER_SIZE: u16 = 64;
const MAX_HEADER_BUFFER_SIZE: u16 = 256;

const DQO_QPL_DEFAULT_TX_PAGES: u16 = 512;
const DQO_QPL_DEFAULT_RX_PAGES: u16 = 2048;

/// Fatal configuration failures during negotiation. These abort device bring-up.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ConfigError {
    MtuTooLow,
    TxRingTooSmall,
    RxRingTooSmall,
}

impl From<ConfigError> for &'static str {
    fn from(error: ConfigError) -> Self {
        match error {
            ConfigError::MtuTooLow => "device MTU below the Ethernet minimum",
            ConfigError::TxRingTooSmall => "tx descriptor count below one page of descriptors",
            ConfigError::RxRingTooSmall => "rx descriptor count below one page of descriptors",
        }
    }
}

/// The negotiated, driver-wide device configuration.
///
/// Single-writer (describe/configure sequences), multi-reader.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub queue_format: QueueFormat,
    pub supported_features: SupportedFeatures,
    pub mac: [u8; 6],
    pub max_mtu: u16,
    pub max_registered_pages: u64,
    pub num_event_counters: u16,
    pub default_num_queues: u16,
    pub tx_desc_count: u16,
    pub rx_desc_count: u16,
    pub tx_pages_per_qpl: u16,
    pub rx_pages_per_qpl: u16,
    /// Completion ring entries for DQO raw addressing.
    pub tx_comp_ring_entries: u16,
    /// Buffer ring entries for DQO raw addressing.
    pub rx_buff_ring_entries: u16,
    pub packet_buffer_size: u16,
    pub header_buffer_size: u16,
    pub header_split_enabled: bool,
    /// Maximum number of flow steering rules; 0 means the feature is absent.
    pub flow_rules_max: u16,
    /// The descriptor-queue formats can coalesce received segments in hardware.
    pub supports_rsc: bool,
}

impl Default for DeviceConfig {
    fn default() -> DeviceConfig {
        DeviceConfig {
            queue_format: QueueFormat::Unspecified,
            supported_features: SupportedFeatures::empty(),
            mac: [0; 6],
            max_mtu: 0,
            max_registered_pages: 0,
            num_event_counters: 0,
            default_num_queues: 0,
            tx_desc_count: 0,
            rx_desc_count: 0,
            tx_pages_per_qpl: 0,
            rx_pages_per_qpl: 0,
            tx_comp_ring_entries: 0,
            rx_buff_ring_entries: 0,
            packet_buffer_size: DEFAULT_PACKET_BUFFER_SIZE,
            header_buffer_size: 0,
            header_split_enabled: false,
            flow_rules_max: 0,
            supports_rsc: false,
        }
    }
}

/// Derives a fresh [`DeviceConfig`] from a parsed descriptor.
///
/// `prior_format` is the format negotiated by a previous describe, if any; a
/// device that advertised raw addressing without a GQI-RDA option keeps that
/// format when nothing with higher priority is present.
pub fn negotiate(
    descriptor: &DeviceDescriptor,
    options: &DeviceOptions,
    prior_format: QueueFormat,
) -> Result<DeviceConfig, ConfigError> {
    let mut config = DeviceConfig::default();

    // The raw-addressing marker is an older device's way of requesting GQI-RDA.
    let carried_gqi_rda = options.gqi_raw_addressing || prior_format == QueueFormat::GqiRda;

    // Queue format in strict priority order: DqoRda, DqoQpl, GqiRda, carried-over
    // GqiRda, with GqiQpl as the default.
    let mut supported_features_mask = 0;
    if let Some(dqo_rda) = &options.dqo_rda {
        config.queue_format = QueueFormat::DqoRda;
        supported_features_mask = dqo_rda.supported_features_mask.get();
        info!("driver is running with DQO RDA queue format");
    } else if let Some(dqo_qpl) = &options.dqo_qpl {
        config.queue_format = QueueFormat::DqoQpl;
        supported_features_mask = dqo_qpl.supported_features_mask.get();
        info!("driver is running with DQO QPL queue format");
    } else if let Some(gqi_rda) = &options.gqi_rda {
        config.queue_format = QueueFormat::GqiRda;
        supported_features_mask = gqi_rda.supported_features_mask.get();
        info!("driver is running with GQI RDA queue format");
    } else if carried_gqi_rda {
        config.queue_format = QueueFormat::GqiRda;
        info!("driver is running with GQI RDA queue format");
    } else {
        config.queue_format = QueueFormat::GqiQpl;
        if let Some(gqi_qpl) = &options.gqi_qpl {
            supported_features_mask = gqi_qpl.supported_features_mask.get();
        }
        info!("driver is running with GQI QPL queue format");
    }
    config.supported_features = SupportedFeatures::from_bits_truncate(supported_features_mask);

    config.tx_desc_count = descriptor.tx_queue_entries.get();
    config.rx_desc_count = descriptor.rx_queue_entries.get();
    if config.queue_format.is_gqi() {
        // The classic layout requires at least one page worth of descriptors.
        if (config.tx_desc_count as usize) * GQI_TX_DESC_SIZE < PAGE_SIZE {
            error!("tx desc count {} too low", config.tx_desc_count);
            return Err(ConfigError::TxRingTooSmall);
        }
        if (config.rx_desc_count as usize) * GQI_RX_DESC_SIZE < PAGE_SIZE {
            error!("rx desc count {} too low", config.rx_desc_count);
            return Err(ConfigError::RxRingTooSmall);
        }
    } else {
        config.supports_rsc = true;
        if config.queue_format == QueueFormat::DqoRda {
            if let Some(dqo_rda) = &options.dqo_rda {
                config.tx_comp_ring_entries = dqo_rda.tx_comp_ring_entries.get();
                config.rx_buff_ring_entries = dqo_rda.rx_buff_ring_entries.get();
            }
        }
    }

    let mtu = descriptor.mtu.get();
    if mtu < MIN_MTU {
        error!("MTU {} below minimum MTU", mtu);
        return Err(ConfigError::MtuTooLow);
    }
    config.max_mtu = mtu;

    config.max_registered_pages = descriptor.max_registered_pages.get();
    config.num_event_counters = descriptor.counters.get();
    config.mac = descriptor.mac;
    config.tx_pages_per_qpl = descriptor.tx_pages_per_qpl.get();
    config.rx_pages_per_qpl = descriptor.rx_pages_per_qpl.get();

    if config.queue_format.is_gqi() && config.rx_pages_per_qpl < config.rx_desc_count {
        error!(
            "rx page list slots cannot be fewer than rx descriptors, setting rx desc count down to {}",
            config.rx_pages_per_qpl
        );
        config.rx_desc_count = config.rx_pages_per_qpl;
    }
    config.default_num_queues = descriptor.default_num_queues.get();

    enable_supported_features(&mut config, options);

    info!(
        "MAC addr: {:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        config.mac[0], config.mac[1], config.mac[2], config.mac[3], config.mac[4], config.mac[5]
    );

    Ok(config)
}

/// Applies the optional features gated by the winning format's feature mask.
fn enable_supported_features(config: &mut DeviceConfig, options: &DeviceOptions) {
    // The descriptor's own MTU field stays page-size-capped; a device that can do
    // jumbo frames advertises the true maximum separately.
    if let Some(jumbo) = &options.jumbo_frames {
        if config.supported_features.contains(SupportedFeatures::JUMBO_FRAMES) {
            info!("JUMBO FRAMES device option enabled");
            config.max_mtu = jumbo.max_mtu.get();
        }
    }

    config.packet_buffer_size = DEFAULT_PACKET_BUFFER_SIZE;
    config.header_buffer_size = 0;

    if let Some(buffer_sizes) = &options.buffer_sizes {
        if config.supported_features.contains(SupportedFeatures::BUFFER_SIZES) {
            info!("BUFFER SIZES device option enabled");
            let packet_size = buffer_sizes.packet_buffer_size.get();
            if packet_size != 0 {
                config.packet_buffer_size = clamp_buffer_size(
                    packet_size,
                    DEFAULT_PACKET_BUFFER_SIZE,
                    MIN_PACKET_BUFFER_SIZE,
                    MAX_PACKET_BUFFER_SIZE,
                );
            }
            let header_size = buffer_sizes.header_buffer_size.get();
            if header_size != 0 {
                config.header_buffer_size = clamp_buffer_size(
                    header_size,
                    DEFAULT_HEADER_BUFFER_SIZE,
                    MIN_HEADER_BUFFER_SIZE,
                    MAX_HEADER_BUFFER_SIZE,
                );
            }
        }
    }
    config.header_split_enabled = config.header_buffer_size != 0;

    if let Some(flow_steering) = &options.flow_steering {
        if config.supported_features.contains(SupportedFeatures::FLOW_STEERING) {
            info!("FLOW STEERING device option enabled");
            config.flow_rules_max = flow_steering.max_num_rules.get();
        }
    }

    // Page-count overrides for the DQO QPL format; zero falls back to the
    // per-mode default.
    if let Some(dqo_qpl) = &options.dqo_qpl {
        config.tx_pages_per_qpl = dqo_qpl.tx_pages_per_qpl.get();
        config.rx_pages_per_qpl = dqo_qpl.rx_pages_per_qpl.get();
        if config.tx_pages_per_qpl == 0 {
            config.tx_pages_per_qpl = DQO_QPL_DEFAULT_TX_PAGES;
        }
        if config.rx_pages_per_qpl == 0 {
            config.rx_pages_per_qpl = DQO_QPL_DEFAULT_RX_PAGES;
        }
    }
}

/// A buffer size must be a power of two (otherwise the default is used) and is
/// then clamped to the supported range.
fn clamp_buffer_size(requested: u16, default: u16, min: u16, max: u16) -> u16 {
    let mut size = requested;
    if !size.is_power_of_two() {
        size = default;
    }
    if size < min {
        size = min;
    }
    if size > max {
        size = max;
    }
    size
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_descriptor::tests::{build_descriptor, features_payload};
    use crate::device_descriptor::{parse, DeviceOptionId};
    use alloc::vec::Vec;

    const GQI_OK_TX: u16 = 512;
    const GQI_OK_RX: u16 = 1024;

    fn negotiate_with(
        mtu: u16,
        tx: u16,
        rx: u16,
        options: &[(u16, u32, &[u8])],
    ) -> Result<DeviceConfig, ConfigError> {
        let bytes = build_descriptor(mtu, tx, rx, options);
        let (descriptor, parsed) = parse(&bytes).unwrap();
        negotiate(&descriptor, &parsed, QueueFormat::Unspecified)
    }

    fn option_payload(mask: u32, tail: &[u8]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&features_payload(mask));
        payload.extend_from_slice(tail);
        payload
    }

    #[test]
    fn defaults_to_gqi_qpl() {
        let config = negotiate_with(1460, GQI_OK_TX, GQI_OK_RX, &[]).unwrap();
        assert_eq!(config.queue_format, QueueFormat::GqiQpl);
        assert_eq!(config.packet_buffer_size, 2048);
        assert_eq!(config.flow_rules_max, 0);
        assert!(!config.supports_rsc);
    }

    #[test]
    fn dqo_rda_wins_over_gqi_qpl() {
        let dqo = option_payload(0, &[0u8, 128, 0, 128]);
        let gqi = features_payload(0);
        let config = negotiate_with(
            1460,
            GQI_OK_TX,
            GQI_OK_RX,
            &[
                (DeviceOptionId::GqiQpl as u16, 0, &gqi),
                (DeviceOptionId::DqoRda as u16, 0, &dqo),
            ],
        )
        .unwrap();
        assert_eq!(config.queue_format, QueueFormat::DqoRda);
        assert_eq!(config.tx_comp_ring_entries, 128);
        assert!(config.supports_rsc);
    }

    #[test]
    fn raw_addressing_marker_carries_gqi_rda() {
        let config =
            negotiate_with(1460, GQI_OK_TX, GQI_OK_RX, &[(DeviceOptionId::GqiRawAddressing as u16, 0, &[])])
                .unwrap();
        assert_eq!(config.queue_format, QueueFormat::GqiRda);
    }

    #[test]
    fn prior_gqi_rda_format_is_kept() {
        let bytes = build_descriptor(1460, GQI_OK_TX, GQI_OK_RX, &[]);
        let (descriptor, options) = parse(&bytes).unwrap();
        let config = negotiate(&descriptor, &options, QueueFormat::GqiRda).unwrap();
        assert_eq!(config.queue_format, QueueFormat::GqiRda);
    }

    #[test]
    fn mtu_at_minimum_passes_and_below_fails() {
        assert!(negotiate_with(MIN_MTU, GQI_OK_TX, GQI_OK_RX, &[]).is_ok());
        assert_eq!(
            negotiate_with(MIN_MTU - 1, GQI_OK_TX, GQI_OK_RX, &[]),
            Err(ConfigError::MtuTooLow)
        );
    }

    #[test]
    fn gqi_rings_must_cover_a_page() {
        // 255 tx descriptors * 16 bytes < 4096.
        assert_eq!(
            negotiate_with(1460, 255, GQI_OK_RX, &[]),
            Err(ConfigError::TxRingTooSmall)
        );
        // 127 rx descriptors * 32 bytes < 4096.
        assert_eq!(
            negotiate_with(1460, GQI_OK_TX, 127, &[]),
            Err(ConfigError::RxRingTooSmall)
        );
        assert!(negotiate_with(1460, 256, 128, &[]).is_ok());
    }

    #[test]
    fn dqo_rings_skip_the_page_floor() {
        let dqo = option_payload(0, &[0u8, 64, 0, 64]);
        let config =
            negotiate_with(1460, 128, 64, &[(DeviceOptionId::DqoRda as u16, 0, &dqo)]).unwrap();
        assert_eq!(config.tx_desc_count, 128);
        assert_eq!(config.rx_desc_count, 64);
    }

    #[test]
    fn gqi_rx_ring_clamped_to_page_list_slots() {
        // The builder advertises 2048 rx page-list slots; ask for 4096 descriptors.
        let config = negotiate_with(1460, GQI_OK_TX, 4096, &[]).unwrap();
        assert_eq!(config.rx_desc_count, 2048);
    }

    #[test]
    fn jumbo_frames_requires_feature_bit() {
        let jumbo = option_payload(0, &[0x23, 0x28, 0, 0]); // max_mtu 9000
        let gqi_plain = features_payload(0);
        let config = negotiate_with(
            1460,
            GQI_OK_TX,
            GQI_OK_RX,
            &[
                (DeviceOptionId::GqiQpl as u16, 0, &gqi_plain),
                (DeviceOptionId::JumboFrames as u16, 0, &jumbo),
            ],
        )
        .unwrap();
        // Without the feature bit in the winning format's mask, the descriptor MTU stands.
        assert_eq!(config.max_mtu, 1460);

        let gqi_jumbo = features_payload(SupportedFeatures::JUMBO_FRAMES.bits());
        let config = negotiate_with(
            1460,
            GQI_OK_TX,
            GQI_OK_RX,
            &[
                (DeviceOptionId::GqiQpl as u16, 0, &gqi_jumbo),
                (DeviceOptionId::JumboFrames as u16, 0, &jumbo),
            ],
        )
        .unwrap();
        assert_eq!(config.max_mtu, 9000);
    }

    #[test]
    fn non_power_of_two_packet_buffer_falls_back_to_default() {
        let dqo = option_payload(SupportedFeatures::BUFFER_SIZES.bits(), &[0u8, 128, 0, 128]);
        let mut sizes = option_payload(0, &3000u16.to_be_bytes());
        sizes.extend_from_slice(&0u16.to_be_bytes());
        let config = negotiate_with(
            1460,
            GQI_OK_TX,
            GQI_OK_RX,
            &[
                (DeviceOptionId::DqoRda as u16, 0, &dqo),
                (DeviceOptionId::BufferSizes as u16, 0, &sizes),
            ],
        )
        .unwrap();
        assert_eq!(config.packet_buffer_size, 2048);
        assert_eq!(config.header_buffer_size, 0);
        assert!(!config.header_split_enabled);
    }

    #[test]
    fn header_buffer_size_is_clamped_and_enables_header_split() {
        let dqo = option_payload(SupportedFeatures::BUFFER_SIZES.bits(), &[0u8, 128, 0, 128]);
        // packet 4096 (valid), header 1024 (power of two but above max -> clamped to 256)
        let mut sizes = option_payload(0, &4096u16.to_be_bytes());
        sizes.extend_from_slice(&1024u16.to_be_bytes());
        let config = negotiate_with(
            1460,
            GQI_OK_TX,
            GQI_OK_RX,
            &[
                (DeviceOptionId::DqoRda as u16, 0, &dqo),
                (DeviceOptionId::BufferSizes as u16, 0, &sizes),
            ],
        )
        .unwrap();
        assert_eq!(config.packet_buffer_size, 4096);
        assert_eq!(config.header_buffer_size, 256);
        assert!(config.header_split_enabled);
    }

    #[test]
    fn flow_steering_capacity_requires_feature_bit() {
        let dqo = option_payload(SupportedFeatures::FLOW_STEERING.bits(), &[0u8, 128, 0, 128]);
        let mut steering = option_payload(0, &[0, 0]);
        steering.extend_from_slice(&200u16.to_be_bytes());
        let config = negotiate_with(
            1460,
            GQI_OK_TX,
            GQI_OK_RX,
            &[
                (DeviceOptionId::DqoRda as u16, 0, &dqo),
                (DeviceOptionId::FlowSteering as u16, 0, &steering),
            ],
        )
        .unwrap();
        assert_eq!(config.flow_rules_max, 200);
    }

    #[test]
    fn skipped_option_negotiates_as_if_absent() {
        // DQO RDA with a bad feature mask is skipped by the parser, so the format
        // selection falls through to the default.
        let dqo = option_payload(0, &[0u8, 128, 0, 128]);
        let config = negotiate_with(
            1460,
            GQI_OK_TX,
            GQI_OK_RX,
            &[(DeviceOptionId::DqoRda as u16, 0xBAD, &dqo)],
        )
        .unwrap();
        assert_eq!(config.queue_format, QueueFormat::GqiQpl);
    }

    #[test]
    fn dqo_qpl_zero_page_counts_fall_back_to_defaults() {
        let dqo_qpl = option_payload(0, &[0u8, 0, 0, 0]);
        let config = negotiate_with(
            1460,
            GQI_OK_TX,
            GQI_OK_RX,
            &[(DeviceOptionId::DqoQpl as u16, 0, &dqo_qpl)],
        )
        .unwrap();
        assert_eq!(config.queue_format, QueueFormat::DqoQpl);
        assert_eq!(config.tx_pages_per_qpl, 512);
        assert_eq!(config.rx_pages_per_qpl, 2048);
    }
}
