//! Receive-side scaling configuration: hash algorithm, secret key and the
//! indirection table mapping hash buckets to receive queues.
//!
//! The state is lazily initialized the first time the configuration surface
//! touches it; until then the device keeps whatever default hashing it boots with.

use alloc::vec::Vec;

use num_enum::TryFromPrimitive;

/// Length in bytes of the RSS hash key.
pub const RSS_KEY_SIZE: usize = 40;
/// Number of entries in the RSS indirection table.
pub const RSS_INDIRECTION_TABLE_SIZE: usize = 128;

/// Hash algorithms the device understands, as encoded on the wire.
#[derive(Debug, PartialEq, Eq, Copy, Clone, TryFromPrimitive)]
#[repr(u8)]
pub enum HashAlgorithm {
    Undefined = 0,
    Toeplitz  = 1,
}

/// Driver-side RSS state.
#[derive(Debug, Clone)]
pub struct RssConfig {
    algorithm: HashAlgorithm,
    key: Vec<u8>,
    indirection_table: Vec<u32>,
}

impl RssConfig {
    /// An untouched configuration; the device default stays in effect.
    pub fn new() -> RssConfig {
        RssConfig { algorithm: HashAlgorithm::Undefined, key: Vec::new(), indirection_table: Vec::new() }
    }

    /// Whether a configuration request has initialized the state yet.
    pub fn is_initialized(&self) -> bool {
        !self.key.is_empty()
    }

    /// First-touch initialization: a zeroed key (callers provide a real one) and
    /// an indirection table spreading buckets round-robin over the active queues.
    pub(crate) fn initialize(&mut self, num_queues: u16) {
        let queues = if num_queues == 0 { 1 } else { num_queues as u32 };
        self.key.clear();
        self.key.resize(RSS_KEY_SIZE, 0);
        self.indirection_table = (0..RSS_INDIRECTION_TABLE_SIZE as u32)
            .map(|bucket| bucket % queues)
            .collect();
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub(crate) fn set_algorithm(&mut self, algorithm: HashAlgorithm) {
        self.algorithm = algorithm;
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub(crate) fn set_key(&mut self, key: &[u8]) {
        self.key.clear();
        self.key.extend_from_slice(key);
    }

    pub fn indirection_table(&self) -> &[u32] {
        &self.indirection_table
    }

    pub(crate) fn set_indirection_table(&mut self, table: &[u32]) {
        self.indirection_table.clear();
        self.indirection_table.extend_from_slice(table);
    }
}
