//! A driver for the control plane of the gVNIC paravirtual network device.
//!
//! The device is managed through a single admin queue: a page-sized ring of
//! fixed-size command slots the driver produces into and the device consumes from
//! in FIFO order. Bring-up runs DESCRIBE_DEVICE, parses the returned descriptor's
//! self-describing option records, and negotiates the queue format and feature set
//! the rest of the driver operates under. The same queue then carries queue
//! lifecycle, flow steering and RSS configuration commands.
//!
//! The data-plane packet rings, interrupt management and PCI enumeration live
//! elsewhere; this crate touches them only through the addresses callers pass in
//! and the [`hal::GvnicHal`] platform boundary.

#![no_std]

extern crate alloc;
#[cfg(test)]
extern crate std;

#[macro_use]
extern crate log;
#[macro_use]
extern crate static_assertions;
#[macro_use]
extern crate bitflags;

pub mod hal;
pub mod command;
pub mod admin_queue;
pub mod device_descriptor;
pub mod device_config;
pub mod flow_spec;
pub mod flow_rules;
pub mod rss;

#[cfg(test)]
pub(crate) mod fake_nic;

use spin::Mutex;

use admin_queue::{
    AdminQueue, AdminQueueError, AdminQueueStats, DeviceResources, PacketType, RxQueueParams,
    TxQueueParams,
};
use alloc::vec::Vec;
use device_config::DeviceConfig;
use flow_rules::{FlowRule, FlowRuleDirectory, FlowRuleError};
use flow_spec::FlowSpec;
use hal::GvnicHal;
use rss::{HashAlgorithm, RssConfig, RSS_INDIRECTION_TABLE_SIZE, RSS_KEY_SIZE};

/// Driver-wide state for one gVNIC device.
///
/// The admin queue engine itself is not thread-safe, so it lives behind a mutex;
/// the flow rule directory carries its own lock. The negotiated configuration has
/// a single writer (the describe/configure sequences) and many readers.
pub struct GvnicDevice<H: GvnicHal> {
    adminq: Mutex<AdminQueue<H>>,
    config: DeviceConfig,
    flow_rules: FlowRuleDirectory,
    rss: Mutex<RssConfig>,
}

impl<H: GvnicHal> GvnicDevice<H> {
    /// Allocates the admin queue and registers it with the device. The device is
    /// not usable until [`GvnicDevice::describe_device`] has run.
    pub fn new(hal: H) -> Result<GvnicDevice<H>, &'static str> {
        let adminq = AdminQueue::new(hal)?;
        Ok(GvnicDevice {
            adminq: Mutex::new(adminq),
            config: DeviceConfig::default(),
            flow_rules: FlowRuleDirectory::new(),
            rss: Mutex::new(RssConfig::new()),
        })
    }

    /// Runs DESCRIBE_DEVICE and re-derives the whole negotiated configuration
    /// from the returned descriptor snapshot.
    pub fn describe_device(&mut self) -> Result<(), &'static str> {
        let adminq = self.adminq.get_mut();
        let snapshot = adminq.describe_device()?;
        let (descriptor, options) = device_descriptor::parse(snapshot.as_bytes())?;
        let config = device_config::negotiate(&descriptor, &options, self.config.queue_format)?;
        self.flow_rules.set_limit(config.flow_rules_max);
        self.config = config;
        Ok(())
    }

    /// The negotiated configuration.
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// A snapshot of the admin queue's command statistics.
    pub fn adminq_stats(&self) -> AdminQueueStats {
        self.adminq.lock().stats().clone()
    }

    /// Tears the admin queue down, handing its memory back once the device lets go.
    pub fn release(&mut self) {
        self.adminq.get_mut().release();
    }

    /// Resets a dead admin queue (after [`AdminQueueError::QueueTimeout`]).
    pub fn reset_admin_queue(&mut self) -> Result<(), &'static str> {
        self.adminq.get_mut().reset()
    }

    /*** Device resource and queue lifecycle ***/

    pub fn configure_device_resources(
        &self,
        resources: &DeviceResources,
    ) -> Result<(), AdminQueueError> {
        self.adminq
            .lock()
            .configure_device_resources(resources, self.config.queue_format)
    }

    pub fn deconfigure_device_resources(&self) -> Result<(), AdminQueueError> {
        self.adminq.lock().deconfigure_device_resources()
    }

    pub fn register_page_list(
        &self,
        page_list_id: u32,
        page_addrs: &[u64],
    ) -> Result<(), AdminQueueError> {
        self.adminq.lock().register_page_list(page_list_id, page_addrs)
    }

    pub fn unregister_page_list(&self, page_list_id: u32) -> Result<(), AdminQueueError> {
        self.adminq.lock().unregister_page_list(page_list_id)
    }

    pub fn create_tx_queues(&self, queues: &[TxQueueParams]) -> Result<(), AdminQueueError> {
        self.adminq.lock().create_tx_queues(&self.config, queues)
    }

    pub fn create_rx_queues(&self, queues: &[RxQueueParams]) -> Result<(), AdminQueueError> {
        self.adminq.lock().create_rx_queues(&self.config, queues)
    }

    pub fn destroy_tx_queues(&self, queue_ids: &[u32]) -> Result<(), AdminQueueError> {
        self.adminq.lock().destroy_tx_queues(queue_ids)
    }

    pub fn destroy_rx_queues(&self, queue_ids: &[u32]) -> Result<(), AdminQueueError> {
        self.adminq.lock().destroy_rx_queues(queue_ids)
    }

    pub fn set_mtu(&self, mtu: u64) -> Result<(), AdminQueueError> {
        self.adminq.lock().set_mtu(mtu)
    }

    pub fn report_stats(
        &self,
        stats_report_addr: u64,
        stats_report_len: u64,
        interval: u64,
    ) -> Result<(), AdminQueueError> {
        self.adminq
            .lock()
            .report_stats(stats_report_addr, stats_report_len, interval)
    }

    pub fn report_link_speed(&self) -> Result<u64, AdminQueueError> {
        self.adminq.lock().report_link_speed()
    }

    pub fn get_ptype_map(&self) -> Result<Vec<PacketType>, AdminQueueError> {
        self.adminq.lock().get_ptype_map()
    }

    pub fn verify_driver_compatibility(&self, driver_info: &[u8]) -> Result<(), AdminQueueError> {
        self.adminq.lock().verify_driver_compatibility(driver_info)
    }

    /*** Flow steering ***/

    /// Installs a classification rule at `location`, steering matches to the
    /// receive queue `action`.
    pub fn add_flow_rule(
        &self,
        location: u16,
        spec: &FlowSpec,
        action: u32,
    ) -> Result<(), FlowRuleError> {
        let mut adminq = self.adminq.lock();
        self.flow_rules.add(
            &mut adminq,
            location,
            spec,
            action,
            self.config.default_num_queues as u32,
        )
    }

    /// Removes the classification rule at `location`.
    pub fn delete_flow_rule(&self, location: u16) -> Result<(), FlowRuleError> {
        let mut adminq = self.adminq.lock();
        self.flow_rules.delete(&mut adminq, location)
    }

    /// Drops every installed classification rule, firmware side included.
    pub fn reset_flow_rules(&self) -> Result<(), FlowRuleError> {
        let mut adminq = self.adminq.lock();
        self.flow_rules.reset(&mut adminq)
    }

    pub fn flow_rule(&self, location: u16) -> Option<FlowRule> {
        self.flow_rules.lookup(location)
    }

    pub fn flow_rule_locations(&self) -> Vec<u16> {
        self.flow_rules.locations()
    }

    pub fn flow_rules(&self) -> Vec<FlowRule> {
        self.flow_rules.list()
    }

    pub fn flow_rule_count(&self) -> usize {
        self.flow_rules.count()
    }

    pub fn flow_rule_limit(&self) -> u16 {
        self.flow_rules.limit()
    }

    /*** RSS ***/

    /// Updates the RSS configuration and pushes it to the device.
    ///
    /// `None` arguments leave the corresponding piece unchanged; the first call
    /// initializes the state with a round-robin table over the active queues.
    pub fn set_rss(
        &self,
        algorithm: Option<HashAlgorithm>,
        key: Option<&[u8]>,
        indirection_table: Option<&[u32]>,
    ) -> Result<(), AdminQueueError> {
        let mut rss = self.rss.lock();

        let mut first_touch = false;
        if !rss.is_initialized() {
            rss.initialize(self.config.default_num_queues);
            first_touch = true;
        }

        match algorithm {
            None => {}
            Some(HashAlgorithm::Toeplitz) => rss.set_algorithm(HashAlgorithm::Toeplitz),
            Some(HashAlgorithm::Undefined) => return Err(AdminQueueError::NotSupported),
        }

        if key.is_none() && indirection_table.is_none() && !first_touch {
            return Ok(());
        }

        if let Some(key) = key {
            if key.len() != RSS_KEY_SIZE {
                return Err(AdminQueueError::InvalidRequest);
            }
            rss.set_key(key);
        }
        if let Some(table) = indirection_table {
            if table.len() != RSS_INDIRECTION_TABLE_SIZE {
                return Err(AdminQueueError::InvalidRequest);
            }
            rss.set_indirection_table(table);
        }

        self.adminq.lock().configure_rss(&rss)
    }

    /// The current RSS configuration, if any set has initialized it.
    pub fn rss_config(&self) -> Option<RssConfig> {
        let rss = self.rss.lock();
        if rss.is_initialized() {
            Some(rss.clone())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandOpcode, CommandStatus};
    use crate::device_config::{QueueFormat, SupportedFeatures};
    use crate::device_descriptor::tests::{build_descriptor, features_payload};
    use crate::device_descriptor::DeviceOptionId;
    use crate::fake_nic::FakeNic;
    use crate::flow_spec::{FlowSpec, Ipv4FlowSpec, Ipv6SecSpec};

    fn dqo_rda_payload(features: u32) -> Vec<u8> {
        let mut payload = features_payload(features).to_vec();
        payload.extend_from_slice(&128u16.to_be_bytes());
        payload.extend_from_slice(&128u16.to_be_bytes());
        payload
    }

    fn flow_steering_payload(max_rules: u16) -> Vec<u8> {
        let mut payload = features_payload(0).to_vec();
        payload.extend_from_slice(&[0, 0]);
        payload.extend_from_slice(&max_rules.to_be_bytes());
        payload
    }

    /// A device negotiated into DQO RDA with `max_rules` flow rule slots.
    fn steering_device(max_rules: u16) -> (FakeNic, GvnicDevice<FakeNic>) {
        let nic = FakeNic::new();
        let dqo = dqo_rda_payload(SupportedFeatures::FLOW_STEERING.bits());
        let steering = flow_steering_payload(max_rules);
        let descriptor = build_descriptor(
            1460,
            512,
            1024,
            &[
                (DeviceOptionId::DqoRda as u16, 0, &dqo),
                (DeviceOptionId::FlowSteering as u16, 0, &steering),
            ],
        );
        nic.set_descriptor(&descriptor);
        let mut device = GvnicDevice::new(nic.clone()).unwrap();
        device.describe_device().unwrap();
        (nic, device)
    }

    fn tcp4_spec(src_port: u16) -> FlowSpec {
        FlowSpec::TcpV4 {
            key: Ipv4FlowSpec {
                src_ip: [192, 168, 0, 1],
                dst_ip: [192, 168, 0, 2],
                src_port,
                dst_port: 443,
                tos: 0,
            },
            mask: Ipv4FlowSpec {
                src_ip: [255; 4],
                dst_ip: [255; 4],
                src_port: 0xFFFF,
                dst_port: 0xFFFF,
                tos: 0,
            },
        }
    }

    fn firmware_calls(nic: &FakeNic) -> usize {
        nic.processed_count(CommandOpcode::ConfigureFlowRule)
    }

    #[test]
    fn describe_device_negotiates_the_configuration() {
        let (nic, device) = steering_device(4);
        let config = device.config();
        assert_eq!(config.queue_format, QueueFormat::DqoRda);
        assert_eq!(config.max_mtu, 1460);
        assert_eq!(config.mac, [0x42, 0x01, 0x0A, 0x00, 0x00, 0x02]);
        assert_eq!(config.flow_rules_max, 4);
        assert_eq!(device.flow_rule_limit(), 4);
        assert_eq!(device.adminq_stats().describe_device, 1);
        assert_eq!(nic.processed_count(CommandOpcode::DescribeDevice), 1);
    }

    #[test]
    fn redescribe_rederives_the_configuration() {
        let (nic, mut device) = steering_device(4);
        // The device stops advertising flow steering after a reset.
        let descriptor = build_descriptor(1460, 512, 1024, &[]);
        nic.set_descriptor(&descriptor);
        device.describe_device().unwrap();
        assert_eq!(device.config().queue_format, QueueFormat::GqiQpl);
        assert_eq!(device.flow_rule_limit(), 0);
    }

    #[test]
    fn add_then_lookup_round_trips_the_rule() {
        let (_nic, device) = steering_device(4);
        let spec = tcp4_spec(1000);
        device.add_flow_rule(7, &spec, 2).unwrap();

        let rule = device.flow_rule(7).unwrap();
        assert_eq!(rule.location, 7);
        assert_eq!(rule.action, 2);
        assert_eq!(rule.spec(), spec);
    }

    #[test]
    fn add_at_an_occupied_location_skips_the_firmware() {
        let (nic, device) = steering_device(4);
        device.add_flow_rule(7, &tcp4_spec(1000), 2).unwrap();
        assert_eq!(firmware_calls(&nic), 1);

        let err = device.add_flow_rule(7, &tcp4_spec(2000), 1).unwrap_err();
        assert_eq!(err, FlowRuleError::AlreadyExists);
        assert_eq!(firmware_calls(&nic), 1);
        assert_eq!(device.flow_rule_count(), 1);
    }

    #[test]
    fn an_identical_match_elsewhere_is_a_duplicate() {
        let (nic, device) = steering_device(4);
        device.add_flow_rule(7, &tcp4_spec(1000), 2).unwrap();

        let err = device.add_flow_rule(8, &tcp4_spec(1000), 3).unwrap_err();
        assert_eq!(err, FlowRuleError::Duplicate);
        assert_eq!(firmware_calls(&nic), 1);
    }

    #[test]
    fn delete_of_a_missing_location_changes_nothing() {
        let (nic, device) = steering_device(4);
        device.add_flow_rule(7, &tcp4_spec(1000), 2).unwrap();

        assert_eq!(device.delete_flow_rule(9).unwrap_err(), FlowRuleError::NotFound);
        assert_eq!(device.flow_rule_count(), 1);
        assert_eq!(firmware_calls(&nic), 1);
    }

    #[test]
    fn delete_unlinks_after_the_firmware_acknowledges() {
        let (nic, device) = steering_device(4);
        device.add_flow_rule(7, &tcp4_spec(1000), 2).unwrap();
        device.delete_flow_rule(7).unwrap();
        assert!(device.flow_rule(7).is_none());
        assert_eq!(device.flow_rule_count(), 0);
        assert_eq!(firmware_calls(&nic), 2);
    }

    #[test]
    fn firmware_rejection_leaves_the_directory_unchanged() {
        let (nic, device) = steering_device(4);
        nic.force_status(CommandOpcode::ConfigureFlowRule, CommandStatus::InvalidArgumentError);

        let err = device.add_flow_rule(7, &tcp4_spec(1000), 2).unwrap_err();
        assert_eq!(err, FlowRuleError::Firmware(AdminQueueError::InvalidRequest));
        assert_eq!(device.flow_rule_count(), 0);
        // A later attempt with a healthy device succeeds at the same location.
        device.add_flow_rule(7, &tcp4_spec(1000), 2).unwrap();
    }

    #[test]
    fn capacity_is_enforced_before_the_firmware() {
        let (nic, device) = steering_device(2);
        device.add_flow_rule(1, &tcp4_spec(1000), 0).unwrap();
        device.add_flow_rule(2, &tcp4_spec(2000), 0).unwrap();

        let err = device.add_flow_rule(3, &tcp4_spec(3000), 0).unwrap_err();
        assert_eq!(err, FlowRuleError::CapacityExceeded);
        assert_eq!(firmware_calls(&nic), 2);
    }

    #[test]
    fn devices_without_the_option_report_not_supported() {
        let nic = FakeNic::new();
        nic.set_descriptor(&build_descriptor(1460, 512, 1024, &[]));
        let mut device = GvnicDevice::new(nic.clone()).unwrap();
        device.describe_device().unwrap();

        let err = device.add_flow_rule(1, &tcp4_spec(1000), 0).unwrap_err();
        assert_eq!(err, FlowRuleError::NotSupported);
        assert_eq!(device.delete_flow_rule(1).unwrap_err(), FlowRuleError::NotSupported);
        assert_eq!(device.reset_flow_rules().unwrap_err(), FlowRuleError::NotSupported);
        assert_eq!(firmware_calls(&nic), 0);
    }

    #[test]
    fn an_out_of_range_target_queue_is_rejected() {
        let (nic, device) = steering_device(4);
        // The descriptor advertises 4 default queues.
        let err = device.add_flow_rule(1, &tcp4_spec(1000), 4).unwrap_err();
        assert_eq!(err, FlowRuleError::InvalidAction);
        assert_eq!(firmware_calls(&nic), 0);
    }

    #[test]
    fn locations_stay_sorted_regardless_of_insertion_order() {
        let (_nic, device) = steering_device(4);
        device.add_flow_rule(9, &tcp4_spec(1000), 0).unwrap();
        device.add_flow_rule(3, &tcp4_spec(2000), 0).unwrap();
        device.add_flow_rule(6, &tcp4_spec(3000), 0).unwrap();
        assert_eq!(device.flow_rule_locations(), [3, 6, 9]);
    }

    #[test]
    fn reset_clears_both_sides() {
        let (nic, device) = steering_device(4);
        device.add_flow_rule(1, &tcp4_spec(1000), 0).unwrap();
        device.add_flow_rule(2, &tcp4_spec(2000), 0).unwrap();
        device.reset_flow_rules().unwrap();
        assert_eq!(device.flow_rule_count(), 0);
        assert_eq!(firmware_calls(&nic), 3);
    }

    #[test]
    fn ipsec_rules_round_trip_with_mask_spi_intact() {
        let (_nic, device) = steering_device(4);
        let spec = FlowSpec::EspV6 {
            key: Ipv6SecSpec { src_ip: [1; 16], dst_ip: [2; 16], spi: 0x0102_0304, traffic_class: 0 },
            mask: Ipv6SecSpec {
                src_ip: [0xFF; 16],
                dst_ip: [0xFF; 16],
                spi: 0xFFFF_FFFF,
                traffic_class: 0,
            },
        };
        device.add_flow_rule(5, &spec, 1).unwrap();
        let rule = device.flow_rule(5).unwrap();
        assert_eq!(rule.mask.spi, 0xFFFF_FFFF);
        assert_eq!(rule.spec(), spec);
    }

    #[test]
    fn rss_is_lazily_initialized_on_first_set() {
        let (nic, device) = steering_device(4);
        assert!(device.rss_config().is_none());

        let key = [7u8; rss::RSS_KEY_SIZE];
        device.set_rss(Some(HashAlgorithm::Toeplitz), Some(&key), None).unwrap();

        let rss = device.rss_config().unwrap();
        assert_eq!(rss.algorithm(), HashAlgorithm::Toeplitz);
        assert_eq!(rss.key(), &key);
        // The untouched table spreads buckets over the 4 advertised queues.
        assert_eq!(&rss.indirection_table()[..5], &[0, 1, 2, 3, 0]);
        assert_eq!(nic.processed_count(CommandOpcode::ConfigureRss), 1);
    }

    #[test]
    fn rss_rejects_bad_arguments() {
        let (nic, device) = steering_device(4);
        assert_eq!(
            device.set_rss(Some(HashAlgorithm::Undefined), None, None),
            Err(AdminQueueError::NotSupported)
        );
        let short_key = [0u8; 8];
        assert_eq!(
            device.set_rss(None, Some(&short_key), None),
            Err(AdminQueueError::InvalidRequest)
        );
        assert_eq!(nic.processed_count(CommandOpcode::ConfigureRss), 0);
    }

    #[test]
    fn setting_the_algorithm_alone_skips_the_device_after_init() {
        let (nic, device) = steering_device(4);
        let key = [7u8; rss::RSS_KEY_SIZE];
        device.set_rss(Some(HashAlgorithm::Toeplitz), Some(&key), None).unwrap();
        // Nothing new to push: no extra device round-trip.
        device.set_rss(Some(HashAlgorithm::Toeplitz), None, None).unwrap();
        assert_eq!(nic.processed_count(CommandOpcode::ConfigureRss), 1);
    }
}
