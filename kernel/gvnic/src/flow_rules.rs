//! The driver-side directory of installed flow steering rules.
//!
//! Every rule exists twice: once in firmware and once here, and the two are kept
//! convergent by ordering rather than two-phase commit. A rule enters the
//! directory only after the firmware ADD succeeds and leaves it only after the
//! firmware DELETE succeeds, so there is never an exposed "pending" state.
//!
//! The directory is internally synchronized: every operation, including the
//! firmware round-trip inside add/delete, runs under one directory-wide lock.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use spin::Mutex;
use zerocopy::byteorder::{U16, U32};

use crate::admin_queue::{AdminQueue, AdminQueueError};
use crate::command::{FlowRuleWire, FlowSpecWire};
use crate::flow_spec::{FlowFields, FlowSpec, FlowType};
use crate::hal::GvnicHal;

/// One installed classification rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowRule {
    /// Externally chosen identifier; unique within the directory.
    pub location: u16,
    pub flow_type: FlowType,
    /// Index of the receive queue matching traffic is steered to.
    pub action: u32,
    pub key: FlowFields,
    pub mask: FlowFields,
}

impl FlowRule {
    /// The family-specific view of this rule.
    pub fn spec(&self) -> FlowSpec {
        FlowSpec::from_key_mask(self.flow_type, &self.key, &self.mask)
    }

    /// Two rules are duplicates if they classify identically, wherever they live.
    fn same_match(&self, other: &FlowRule) -> bool {
        self.flow_type == other.flow_type && self.key == other.key && self.mask == other.mask
    }

    pub(crate) fn to_wire(&self) -> FlowRuleWire {
        FlowRuleWire {
            flow_type: U16::new(self.flow_type as u16),
            action: U16::new(self.action as u16),
            key: fields_to_wire(&self.key),
            mask: fields_to_wire(&self.mask),
        }
    }
}

fn fields_to_wire(fields: &FlowFields) -> FlowSpecWire {
    FlowSpecWire {
        src_ip: fields.src_ip,
        dst_ip: fields.dst_ip,
        src_port: U16::new(fields.src_port),
        dst_port: U16::new(fields.dst_port),
        spi: U32::new(fields.spi),
        traffic_class: fields.traffic_class,
        padding: [0; 3],
    }
}

/// Failures of directory operations.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum FlowRuleError {
    /// The device never advertised a flow rule capacity.
    NotSupported,
    /// The negotiated maximum number of rules is already installed.
    CapacityExceeded,
    /// A rule already occupies the requested location.
    AlreadyExists,
    /// An identical `(flow_type, key, mask)` rule exists at another location.
    Duplicate,
    /// No rule at the requested location.
    NotFound,
    /// The rule's target queue index is out of range.
    InvalidAction,
    /// The firmware command failed; the directory is unchanged.
    Firmware(AdminQueueError),
}

impl From<AdminQueueError> for FlowRuleError {
    fn from(error: AdminQueueError) -> Self {
        FlowRuleError::Firmware(error)
    }
}

impl From<FlowRuleError> for &'static str {
    fn from(error: FlowRuleError) -> Self {
        match error {
            FlowRuleError::NotSupported => "device does not support flow steering rules",
            FlowRuleError::CapacityExceeded => "reached the limit of allowed flow rules",
            FlowRuleError::AlreadyExists => "a flow rule already exists at this location",
            FlowRuleError::Duplicate => "an identical flow rule exists at another location",
            FlowRuleError::NotFound => "no flow rule at this location",
            FlowRuleError::InvalidAction => "flow rule targets a nonexistent queue",
            FlowRuleError::Firmware(inner) => inner.into(),
        }
    }
}

struct DirectoryInner {
    /// Rules keyed (and therefore iterated) by ascending location.
    rules: BTreeMap<u16, FlowRule>,
    /// Negotiated capacity; 0 means the device lacks the feature entirely.
    limit: u16,
}

/// The rule directory. Internally locked; safe to share across rule operations.
pub struct FlowRuleDirectory {
    inner: Mutex<DirectoryInner>,
}

impl FlowRuleDirectory {
    pub fn new() -> FlowRuleDirectory {
        FlowRuleDirectory {
            inner: Mutex::new(DirectoryInner { rules: BTreeMap::new(), limit: 0 }),
        }
    }

    /// Sets the negotiated rule capacity. Called on every describe.
    pub(crate) fn set_limit(&self, limit: u16) {
        self.inner.lock().limit = limit;
    }

    /// The negotiated rule capacity.
    pub fn limit(&self) -> u16 {
        self.inner.lock().limit
    }

    /// Number of rules currently installed.
    pub fn count(&self) -> usize {
        self.inner.lock().rules.len()
    }

    /// Builds, validates and installs a rule: firmware first, directory second.
    pub fn add<H: GvnicHal>(
        &self,
        adminq: &mut AdminQueue<H>,
        location: u16,
        spec: &FlowSpec,
        action: u32,
        num_rx_queues: u32,
    ) -> Result<(), FlowRuleError> {
        let mut inner = self.inner.lock();
        if inner.limit == 0 {
            return Err(FlowRuleError::NotSupported);
        }
        if inner.rules.len() >= inner.limit as usize {
            error!("reached the limit of allowed flow rules ({})", inner.limit);
            return Err(FlowRuleError::CapacityExceeded);
        }
        if inner.rules.contains_key(&location) {
            error!("flow rule {} already exists", location);
            return Err(FlowRuleError::AlreadyExists);
        }
        if action >= num_rx_queues {
            return Err(FlowRuleError::InvalidAction);
        }

        let (key, mask) = spec.to_key_mask();
        let rule = FlowRule { location, flow_type: spec.flow_type(), action, key, mask };
        if inner.rules.values().any(|existing| existing.same_match(&rule)) {
            return Err(FlowRuleError::Duplicate);
        }

        adminq.add_flow_rule(&rule)?;
        info!(
            "installed {} flow rule {} steering to queue {}",
            rule.flow_type.name(),
            location,
            action
        );
        inner.rules.insert(location, rule);
        Ok(())
    }

    /// Removes the rule at `location`: firmware first, directory second.
    pub fn delete<H: GvnicHal>(
        &self,
        adminq: &mut AdminQueue<H>,
        location: u16,
    ) -> Result<(), FlowRuleError> {
        let mut inner = self.inner.lock();
        if inner.limit == 0 {
            return Err(FlowRuleError::NotSupported);
        }
        if !inner.rules.contains_key(&location) {
            return Err(FlowRuleError::NotFound);
        }

        adminq.delete_flow_rule(location)?;
        inner.rules.remove(&location);
        Ok(())
    }

    /// Clears the firmware rule table and, on success, the directory.
    pub fn reset<H: GvnicHal>(&self, adminq: &mut AdminQueue<H>) -> Result<(), FlowRuleError> {
        let mut inner = self.inner.lock();
        if inner.limit == 0 {
            return Err(FlowRuleError::NotSupported);
        }
        adminq.reset_flow_rules()?;
        inner.rules.clear();
        Ok(())
    }

    /// The rule at `location`, if any.
    pub fn lookup(&self, location: u16) -> Option<FlowRule> {
        self.inner.lock().rules.get(&location).cloned()
    }

    /// Locations of all installed rules, ascending.
    pub fn locations(&self) -> Vec<u16> {
        self.inner.lock().rules.keys().copied().collect()
    }

    /// All installed rules in ascending location order.
    pub fn list(&self) -> Vec<FlowRule> {
        self.inner.lock().rules.values().cloned().collect()
    }
}
