//! A software model of the gVNIC firmware, driving the real `GvnicHal` boundary.
//!
//! The fake keeps a registry of every coherent buffer handed out, locates the
//! command ring through the page frame number the driver programs, and executes
//! commands when the doorbell is rung: it pops a per-opcode forced status (default
//! success), performs the side effects of DESCRIBE_DEVICE and REPORT_LINK_SPEED,
//! writes the status word back into the slot and advances its completion counter.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::command::{CommandOpcode, CommandStatus, COMMAND_SLOT_SIZE, COMMAND_STATUS_OFFSET};
use crate::hal::{DmaBuffer, GvnicHal, PAGE_SIZE};

#[derive(Clone, Copy)]
struct BufferRecord {
    ptr: usize,
    len: usize,
}

/// One command the fake firmware executed, as observed on the wire.
#[derive(Clone)]
pub(crate) struct ProcessedCommand {
    /// The accounting opcode: extended envelopes are recorded as their inner opcode.
    pub opcode: u32,
    /// Ring slot the command occupied.
    pub slot: usize,
    /// Payload bytes (the inner command for extended envelopes).
    pub payload: Vec<u8>,
}

#[derive(Default)]
struct FakeState {
    buffers: BTreeMap<u64, BufferRecord>,
    /// Next synthetic bus address to hand out; page-aligned and kept within a
    /// 32-bit page frame number so the `pfn` register round-trips on 64-bit hosts.
    next_bus: u64,
    adminq_pfn: u32,
    event_counter: u32,
    /// Statuses to hand out per accounting opcode, oldest first; default is success.
    forced_statuses: BTreeMap<u32, Vec<u32>>,
    /// When set, doorbell writes are ignored and commands never complete.
    stalled: bool,
    /// Descriptor bytes DESCRIBE_DEVICE writes into the driver's snapshot buffer.
    descriptor: Vec<u8>,
    link_speed: u64,
    processed: Vec<ProcessedCommand>,
    sleeps: u32,
}

/// Handle to the fake device; clones share the same state.
#[derive(Clone)]
pub(crate) struct FakeNic {
    state: Arc<Mutex<FakeState>>,
}

impl FakeNic {
    pub fn new() -> FakeNic {
        FakeNic { state: Arc::new(Mutex::new(FakeState::default())) }
    }

    pub fn set_descriptor(&self, bytes: &[u8]) {
        self.state.lock().descriptor = bytes.to_vec();
    }

    pub fn set_link_speed(&self, speed: u64) {
        self.state.lock().link_speed = speed;
    }

    /// Queues a status for the next command with the given accounting opcode.
    pub fn force_status(&self, opcode: CommandOpcode, status: CommandStatus) {
        self.state
            .lock()
            .forced_statuses
            .entry(opcode as u32)
            .or_insert_with(Vec::new)
            .push(status as u32);
    }

    /// Makes the device stop completing commands entirely.
    pub fn stall(&self) {
        self.state.lock().stalled = true;
    }

    pub fn processed(&self) -> Vec<ProcessedCommand> {
        self.state.lock().processed.clone()
    }

    pub fn processed_count(&self, opcode: CommandOpcode) -> usize {
        self.state
            .lock()
            .processed
            .iter()
            .filter(|cmd| cmd.opcode == opcode as u32)
            .count()
    }

    pub fn sleeps(&self) -> u32 {
        self.state.lock().sleeps
    }

    pub fn adminq_pfn(&self) -> u32 {
        self.state.lock().adminq_pfn
    }
}

impl GvnicHal for FakeNic {
    fn alloc_coherent(&self, len: usize) -> Result<DmaBuffer, &'static str> {
        let state = self.state.clone();
        DmaBuffer::alloc_zeroed(len, move |ptr| {
            let mut guard = state.lock();
            // Hand out a synthetic, page-aligned bus address instead of the raw host
            // pointer: a 64-bit pointer's page frame number does not fit the device's
            // 32-bit `pfn` register, which would break the pfn round-trip on 64-bit hosts.
            if guard.next_bus == 0 {
                guard.next_bus = PAGE_SIZE as u64;
            }
            let bus = guard.next_bus;
            let pages = (len as u64 + PAGE_SIZE as u64 - 1) / PAGE_SIZE as u64;
            guard.next_bus += pages * PAGE_SIZE as u64;
            guard.buffers.insert(bus, BufferRecord { ptr: ptr as usize, len });
            bus
        })
    }

    fn sleep_ms(&self, _ms: u32) {
        self.state.lock().sleeps += 1;
    }

    fn write_adminq_pfn(&self, pfn: u32) {
        self.state.lock().adminq_pfn = pfn;
    }

    fn read_adminq_pfn(&self) -> u32 {
        self.state.lock().adminq_pfn
    }

    fn write_adminq_doorbell(&self, counter: u32) {
        let mut state = self.state.lock();
        if state.stalled {
            return;
        }
        state.process_until(counter);
    }

    fn read_adminq_event_counter(&self) -> u32 {
        self.state.lock().event_counter
    }
}

impl FakeState {
    fn process_until(&mut self, head: u32) {
        let ring_bus = (self.adminq_pfn as u64) * PAGE_SIZE as u64;
        let ring = match self.buffers.get(&ring_bus) {
            Some(record) => *record,
            None => return,
        };
        let mask = (ring.len / COMMAND_SLOT_SIZE - 1) as u32;

        while self.event_counter != head {
            let slot = (self.event_counter & mask) as usize;
            let base = (ring.ptr + slot * COMMAND_SLOT_SIZE) as *mut u8;
            let slot_bytes =
                unsafe { core::slice::from_raw_parts(base, COMMAND_SLOT_SIZE) }.to_vec();

            let opcode = be32(&slot_bytes[0..4]);
            let (accounting_opcode, payload) =
                if opcode == CommandOpcode::ExtendedCommand as u32 {
                    let inner_opcode = be32(&slot_bytes[4..8]);
                    let inner_length = be32(&slot_bytes[8..12]) as usize;
                    let inner_addr = be64(&slot_bytes[12..20]);
                    (inner_opcode, self.read_buffer(inner_addr, inner_length))
                } else {
                    (opcode, slot_bytes[4..COMMAND_STATUS_OFFSET].to_vec())
                };

            let status = self.next_status(accounting_opcode);
            if status == CommandStatus::Passed as u32 {
                self.side_effects(accounting_opcode, &payload);
            }
            unsafe {
                core::ptr::write_volatile(
                    base.add(COMMAND_STATUS_OFFSET) as *mut [u8; 4],
                    status.to_be_bytes(),
                );
            }

            self.processed.push(ProcessedCommand { opcode: accounting_opcode, slot, payload });
            self.event_counter = self.event_counter.wrapping_add(1);
        }
    }

    fn next_status(&mut self, opcode: u32) -> u32 {
        if let Some(queue) = self.forced_statuses.get_mut(&opcode) {
            if !queue.is_empty() {
                return queue.remove(0);
            }
        }
        CommandStatus::Passed as u32
    }

    fn side_effects(&mut self, opcode: u32, payload: &[u8]) {
        if opcode == CommandOpcode::DescribeDevice as u32 {
            let addr = be64(&payload[0..8]);
            let descriptor = self.descriptor.clone();
            self.write_buffer(addr, &descriptor);
        } else if opcode == CommandOpcode::ReportLinkSpeed as u32 {
            let addr = be64(&payload[0..8]);
            let speed = self.link_speed;
            self.write_buffer(addr, &speed.to_be_bytes());
        }
    }

    fn read_buffer(&self, bus: u64, len: usize) -> Vec<u8> {
        match self.buffers.get(&bus) {
            Some(record) => {
                let len = len.min(record.len);
                unsafe { core::slice::from_raw_parts(record.ptr as *const u8, len) }.to_vec()
            }
            None => Vec::new(),
        }
    }

    fn write_buffer(&mut self, bus: u64, bytes: &[u8]) {
        if let Some(record) = self.buffers.get(&bus) {
            let len = bytes.len().min(record.len);
            unsafe {
                core::ptr::copy_nonoverlapping(bytes.as_ptr(), record.ptr as *mut u8, len);
            }
        }
    }
}

fn be32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn be64(bytes: &[u8]) -> u64 {
    u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}
