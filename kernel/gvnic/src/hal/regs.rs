//! Layout of the device's memory-mapped configuration registers (BAR0).
//!
//! All registers are big-endian. A `GvnicHal` implementation typically maps this
//! struct over the BAR0 MMIO region and forwards the admin queue accessors to it.

use byteorder::BigEndian;
use volatile::Volatile;
use zerocopy::byteorder::U32;

/// The device configuration register block at the start of BAR0.
#[repr(C)]
pub struct GvnicRegisters {
    /// Status bits reported by the device (reset requested, link state).
    pub device_status: Volatile<U32<BigEndian>>,
    /// Status bits reported by the driver back to the device.
    pub driver_status: Volatile<U32<BigEndian>>,
    /// Maximum number of transmit queues the device supports.
    pub max_tx_queues: Volatile<U32<BigEndian>>,
    /// Maximum number of receive queues the device supports.
    pub max_rx_queues: Volatile<U32<BigEndian>>,
    /// Page frame number of the admin queue ring; writing 0 releases the queue.
    pub adminq_pfn: Volatile<U32<BigEndian>>,
    /// Doorbell: the driver writes its producer counter here to kick the device.
    pub adminq_doorbell: Volatile<U32<BigEndian>>,
    /// The device's completion counter, advanced as commands are executed.
    pub adminq_event_counter: Volatile<U32<BigEndian>>,
    _reserved: [u8; 3],
    /// The driver writes its version string here one byte at a time.
    pub driver_version: Volatile<u8>,
}

const_assert_eq!(core::mem::size_of::<GvnicRegisters>(), 32);

impl GvnicRegisters {
    /// Writes the admin queue base register.
    pub fn write_adminq_pfn(&mut self, pfn: u32) {
        self.adminq_pfn.write(U32::new(pfn));
    }

    /// Reads the device's view of the admin queue base register.
    pub fn read_adminq_pfn(&self) -> u32 {
        self.adminq_pfn.read().get()
    }

    /// Rings the admin queue doorbell.
    pub fn write_adminq_doorbell(&mut self, counter: u32) {
        self.adminq_doorbell.write(U32::new(counter));
    }

    /// Reads the device's command completion counter.
    pub fn read_adminq_event_counter(&self) -> u32 {
        self.adminq_event_counter.read().get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::FromBytes;

    #[test]
    fn register_accessors_round_trip() {
        // The register block is plain memory in this test; on hardware it is an
        // MMIO mapping with the same layout.
        let mut page = [0u8; 32];
        let regs = unsafe { &mut *(page.as_mut_ptr() as *mut GvnicRegisters) };
        regs.write_adminq_pfn(0x1234);
        assert_eq!(regs.read_adminq_pfn(), 0x1234);
        regs.write_adminq_doorbell(7);
        assert_eq!(regs.adminq_doorbell.read().get(), 7);
        assert_eq!(regs.read_adminq_event_counter(), 0);

        // Registers are stored big-endian in the mapping.
        let raw = U32::<BigEndian>::read_from(&page[16..20]).unwrap();
        assert_eq!(raw.get(), 0x1234);
    }
}
