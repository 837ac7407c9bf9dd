//! The admin queue: a fixed-size ring of command slots through which the driver
//! negotiates capabilities and configures device resources.
//!
//! The driver produces commands into the ring, rings a doorbell with its producer
//! counter and waits for the device's completion counter to catch up; commands
//! complete in FIFO order, so one kick accounts for a known range of slots. The
//! queue is *not* internally thread-safe: callers must serialize all `issue`,
//! `execute` and `kick_and_wait` calls, e.g. behind a mutex.

use alloc::vec::Vec;
use core::convert::TryFrom;

use ring_index::RingCursor;
use zerocopy::byteorder::{U16, U32, U64};
use zerocopy::{AsBytes, FromBytes};

use crate::command::*;
use crate::device_config::{DeviceConfig, QueueFormat, RAW_ADDRESSING_QPL_ID};
use crate::device_descriptor::DEVICE_DESCRIPTOR_VERSION;
use crate::flow_rules::FlowRule;
use crate::hal::{DmaBuffer, GvnicHal, PAGE_SIZE};
use crate::rss::RssConfig;

/// Number of command slots in the ring (one page of 64-byte slots).
pub const ADMINQ_SLOT_COUNT: u32 = (PAGE_SIZE / COMMAND_SLOT_SIZE) as u32;

/// Bounded poll of the completion counter: retries x sleep interval.
const MAX_EVENT_COUNTER_CHECKS: u32 = 100;
/// Bounded poll of the release handshake.
const MAX_RELEASE_CHECKS: u32 = 500;
/// Sleep between polls, in milliseconds.
const POLL_SLEEP_MS: u32 = 20;

/// Number of entries in the packet-type lookup table returned by GET_PTYPE_MAP.
pub const NUM_PTYPES: usize = 1024;

/// Errors surfaced by admin queue operations.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum AdminQueueError {
    /// The device rejected the command with a transient status; the caller may retry.
    TryAgain,
    /// The device rejected the command as malformed or inapplicable.
    InvalidRequest,
    /// The device reported it could not finish the command in time.
    CommandTimedOut,
    /// The device refused the command for lack of permission.
    AccessDenied,
    /// The device or the host ran out of memory.
    OutOfMemory,
    /// The device does not implement the command.
    NotSupported,
    /// The device completed the command without writing any status.
    UnsetStatus,
    /// The device never reached the expected completion count; the queue is dead
    /// and must be reset before further use.
    QueueTimeout,
    /// No free slot even after draining the queue.
    QueueFull,
    /// `execute` was called while commands were still outstanding.
    QueueNotEmpty,
}

impl From<AdminQueueError> for &'static str {
    fn from(error: AdminQueueError) -> Self {
        match error {
            AdminQueueError::TryAgain => "device asked to retry the admin command",
            AdminQueueError::InvalidRequest => "device rejected the admin command as invalid",
            AdminQueueError::CommandTimedOut => "device timed out executing the admin command",
            AdminQueueError::AccessDenied => "device denied permission for the admin command",
            AdminQueueError::OutOfMemory => "out of memory while handling the admin command",
            AdminQueueError::NotSupported => "device does not support the admin command",
            AdminQueueError::UnsetStatus => "device completed an admin command without a status",
            AdminQueueError::QueueTimeout => "admin queue timed out and needs to be reset",
            AdminQueueError::QueueFull => "no admin queue slot available after draining",
            AdminQueueError::QueueNotEmpty => "admin queue must be empty to execute a command",
        }
    }
}

/// Per-queue command statistics, kept by the engine and exposed read-only.
#[derive(Debug, Default, Clone)]
pub struct AdminQueueStats {
    pub describe_device: u64,
    pub configure_device_resources: u64,
    pub register_page_list: u64,
    pub unregister_page_list: u64,
    pub create_tx_queue: u64,
    pub create_rx_queue: u64,
    pub destroy_tx_queue: u64,
    pub destroy_rx_queue: u64,
    pub deconfigure_device_resources: u64,
    pub set_driver_parameter: u64,
    pub report_stats: u64,
    pub report_link_speed: u64,
    pub get_ptype_map: u64,
    pub verify_driver_compatibility: u64,
    pub configure_rss: u64,
    pub configure_flow_rule: u64,
    /// Commands the device completed with a failure status.
    pub command_failures: u64,
    /// Times the queue itself timed out waiting for completions.
    pub timeouts: u64,
}

impl AdminQueueStats {
    fn record_issue(&mut self, accounting_opcode: u32) {
        match CommandOpcode::try_from(accounting_opcode) {
            Ok(CommandOpcode::DescribeDevice) => self.describe_device += 1,
            Ok(CommandOpcode::ConfigureDeviceResources) => self.configure_device_resources += 1,
            Ok(CommandOpcode::RegisterPageList) => self.register_page_list += 1,
            Ok(CommandOpcode::UnregisterPageList) => self.unregister_page_list += 1,
            Ok(CommandOpcode::CreateTxQueue) => self.create_tx_queue += 1,
            Ok(CommandOpcode::CreateRxQueue) => self.create_rx_queue += 1,
            Ok(CommandOpcode::DestroyTxQueue) => self.destroy_tx_queue += 1,
            Ok(CommandOpcode::DestroyRxQueue) => self.destroy_rx_queue += 1,
            Ok(CommandOpcode::DeconfigureDeviceResources) => {
                self.deconfigure_device_resources += 1
            }
            Ok(CommandOpcode::SetDriverParameter) => self.set_driver_parameter += 1,
            Ok(CommandOpcode::ReportStats) => self.report_stats += 1,
            Ok(CommandOpcode::ReportLinkSpeed) => self.report_link_speed += 1,
            Ok(CommandOpcode::GetPtypeMap) => self.get_ptype_map += 1,
            Ok(CommandOpcode::VerifyDriverCompatibility) => {
                self.verify_driver_compatibility += 1
            }
            Ok(CommandOpcode::ConfigureRss) => self.configure_rss += 1,
            Ok(CommandOpcode::ConfigureFlowRule) => self.configure_flow_rule += 1,
            Ok(CommandOpcode::ExtendedCommand) | Err(_) => {
                error!("adminq: unknown command opcode {:#x}", accounting_opcode);
            }
        }
    }
}

/// Caller-supplied addresses for CONFIGURE_DEVICE_RESOURCES.
pub struct DeviceResources {
    pub counter_array_addr: u64,
    pub num_counters: u32,
    pub irq_db_addr: u64,
    pub num_irq_dbs: u32,
    pub irq_db_stride: u32,
    pub ntfy_blk_msix_base_idx: u32,
}

/// Caller-supplied addresses and ids for CREATE_TX_QUEUE.
pub struct TxQueueParams {
    pub queue_id: u32,
    pub ntfy_id: u32,
    pub queue_resources_addr: u64,
    pub tx_ring_addr: u64,
    pub tx_comp_ring_addr: u64,
    /// Registered page list backing this queue; ignored for raw-addressing formats.
    pub queue_page_list_id: u32,
}

/// Caller-supplied addresses and ids for CREATE_RX_QUEUE.
pub struct RxQueueParams {
    pub queue_id: u32,
    pub ntfy_id: u32,
    pub queue_resources_addr: u64,
    pub rx_desc_ring_addr: u64,
    pub rx_data_ring_addr: u64,
    /// Registered page list backing this queue; ignored for raw-addressing formats.
    pub queue_page_list_id: u32,
    /// Buffer size for this queue in the classic ring layout.
    pub packet_buffer_size: u16,
    pub enable_rsc: bool,
}

/// One entry of the packet-type lookup table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketType {
    pub l3_type: u8,
    pub l4_type: u8,
}

/// The admin queue engine.
pub struct AdminQueue<H: GvnicHal> {
    hal: H,
    ring: DmaBuffer,
    cursor: RingCursor,
    stats: AdminQueueStats,
}

impl<H: GvnicHal> AdminQueue<H> {
    /// Allocates the command ring and registers it with the device.
    pub fn new(hal: H) -> Result<AdminQueue<H>, &'static str> {
        let ring = hal.alloc_coherent(PAGE_SIZE)?;
        let cursor = RingCursor::new(ADMINQ_SLOT_COUNT)?;
        hal.write_adminq_pfn((ring.bus_addr() / PAGE_SIZE as u64) as u32);
        Ok(AdminQueue { hal, ring, cursor, stats: AdminQueueStats::default() })
    }

    /// Command statistics for this queue.
    pub fn stats(&self) -> &AdminQueueStats {
        &self.stats
    }

    /// Tells the device the admin queue is going away and waits for it to let go
    /// of the ring memory.
    pub fn release(&mut self) {
        self.hal.write_adminq_pfn(0);
        let mut checks = 0;
        while self.hal.read_adminq_pfn() != 0 {
            // The device is still holding the ring. Keep waiting rather than free
            // memory it may still write to.
            if checks == MAX_RELEASE_CHECKS {
                error!("adminq: device never released the queue, unrecoverable platform error");
            }
            checks += 1;
            self.hal.sleep_ms(POLL_SLEEP_MS);
        }
    }

    /// Resets the queue after a fatal failure: releases the old ring, allocates a
    /// fresh one, re-registers it with the device and clears the producer counter.
    pub fn reset(&mut self) -> Result<(), &'static str> {
        self.release();
        self.ring = self.hal.alloc_coherent(PAGE_SIZE)?;
        self.cursor.reset();
        self.hal
            .write_adminq_pfn((self.ring.bus_addr() / PAGE_SIZE as u64) as u32);
        Ok(())
    }

    /// Places a command into the next free slot without kicking the device.
    ///
    /// If the ring is full, all outstanding commands are flushed first; a second
    /// collision right after draining means the producer accounting is broken and
    /// is reported as [`AdminQueueError::QueueFull`].
    pub fn issue_command(&mut self, cmd: &AdminqCommand) -> Result<(), AdminQueueError> {
        let tail = self.hal.read_adminq_event_counter();
        if self.cursor.is_full_against(tail) {
            // Flush existing commands to make room, then retry once.
            self.kick_and_wait()?;
            let tail = self.hal.read_adminq_event_counter();
            if self.cursor.is_full_against(tail) {
                // We just drained the queue, so there must be space.
                return Err(AdminQueueError::QueueFull);
            }
        }

        let slot = self.cursor.slot();
        let offset = slot * COMMAND_SLOT_SIZE;
        cmd.encode_into(&mut self.ring.as_bytes_mut()[offset..offset + COMMAND_SLOT_SIZE]);
        self.cursor.advance();
        self.stats.record_issue(cmd.accounting_opcode());
        debug!("adminq: issued {:?} into slot {}", cmd.opcode(), slot);
        Ok(())
    }

    /// Kicks the device and waits until every issued command has completed,
    /// returning the first failure status found in the flushed range.
    pub fn kick_and_wait(&mut self) -> Result<(), AdminQueueError> {
        let tail = self.hal.read_adminq_event_counter();
        let head = self.cursor.count();

        self.hal.write_adminq_doorbell(head);
        if !self.wait_for_completion(head) {
            error!("adminq: commands timed out, queue needs to be reset");
            self.stats.timeouts += 1;
            return Err(AdminQueueError::QueueTimeout);
        }

        let mut counter = tail;
        while counter != head {
            let offset =
                self.cursor.slot_of(counter) * COMMAND_SLOT_SIZE + COMMAND_STATUS_OFFSET;
            let status = self.ring.read_volatile_u32_be(offset);
            // Return the first error; the device has consumed every slot either way.
            self.parse_command_status(status)?;
            counter = counter.wrapping_add(1);
        }
        Ok(())
    }

    /// Issues a single command and waits for its completion.
    ///
    /// Only valid on an empty queue; callers batching commands with
    /// [`AdminQueue::issue_command`] must flush them before calling this.
    pub fn execute_command(&mut self, cmd: &AdminqCommand) -> Result<(), AdminQueueError> {
        let tail = self.hal.read_adminq_event_counter();
        if tail != self.cursor.count() {
            return Err(AdminQueueError::QueueNotEmpty);
        }
        self.issue_command(cmd)?;
        self.kick_and_wait()
    }

    /// Executes a command too large for a slot: the payload is copied into its own
    /// coherent buffer and referenced from an extended-command envelope. The buffer
    /// is freed when the command completes, successfully or not.
    pub fn execute_extended_command(
        &mut self,
        inner_opcode: CommandOpcode,
        inner: &[u8],
    ) -> Result<(), AdminQueueError> {
        let mut buffer = self.alloc_coherent(inner.len())?;
        buffer.as_bytes_mut()[..inner.len()].copy_from_slice(inner);

        let cmd = AdminqCommand::Extended(ExtendedCommand {
            inner_opcode: U32::new(inner_opcode as u32),
            inner_length: U32::new(inner.len() as u32),
            inner_command_addr: U64::new(buffer.bus_addr()),
        });
        self.execute_command(&cmd)
    }

    fn wait_for_completion(&self, head: u32) -> bool {
        for _ in 0..MAX_EVENT_COUNTER_CHECKS {
            if self.hal.read_adminq_event_counter() == head {
                return true;
            }
            self.hal.sleep_ms(POLL_SLEEP_MS);
        }
        false
    }

    fn parse_command_status(&mut self, status: u32) -> Result<(), AdminQueueError> {
        let status = match CommandStatus::try_from(status) {
            Ok(status) => status,
            Err(_) => {
                error!("adminq: unknown status code {:#x}", status);
                self.stats.command_failures += 1;
                return Err(AdminQueueError::InvalidRequest);
            }
        };
        if status != CommandStatus::Passed && status != CommandStatus::Unset {
            error!("adminq: command failed with status {:?}", status);
            self.stats.command_failures += 1;
        }
        match status {
            CommandStatus::Passed => Ok(()),
            CommandStatus::Unset => {
                error!("adminq: status and error both unset, this should not be possible");
                Err(AdminQueueError::UnsetStatus)
            }
            CommandStatus::AbortedError
            | CommandStatus::CancelledError
            | CommandStatus::DatalossError
            | CommandStatus::FailedPreconditionError
            | CommandStatus::UnavailableError => Err(AdminQueueError::TryAgain),
            CommandStatus::AlreadyExistsError
            | CommandStatus::InternalError
            | CommandStatus::InvalidArgumentError
            | CommandStatus::NotFoundError
            | CommandStatus::OutOfRangeError
            | CommandStatus::UnknownError => Err(AdminQueueError::InvalidRequest),
            CommandStatus::DeadlineExceededError => Err(AdminQueueError::CommandTimedOut),
            CommandStatus::PermissionDeniedError | CommandStatus::UnauthenticatedError => {
                Err(AdminQueueError::AccessDenied)
            }
            CommandStatus::ResourceExhaustedError => Err(AdminQueueError::OutOfMemory),
            CommandStatus::UnimplementedError => Err(AdminQueueError::NotSupported),
        }
    }

    fn alloc_coherent(&self, len: usize) -> Result<DmaBuffer, AdminQueueError> {
        self.hal.alloc_coherent(len).map_err(|msg| {
            error!("adminq: coherent allocation failed: {}", msg);
            AdminQueueError::OutOfMemory
        })
    }

    /*** Typed command entry points ***/

    /// Runs DESCRIBE_DEVICE and returns the raw descriptor snapshot for parsing.
    pub fn describe_device(&mut self) -> Result<DmaBuffer, AdminQueueError> {
        let buffer = self.alloc_coherent(PAGE_SIZE)?;
        let cmd = AdminqCommand::DescribeDevice(DescribeDeviceCommand {
            device_descriptor_addr: U64::new(buffer.bus_addr()),
            device_descriptor_version: U32::new(DEVICE_DESCRIPTOR_VERSION),
            available_length: U32::new(PAGE_SIZE as u32),
        });
        self.execute_command(&cmd)?;
        Ok(buffer)
    }

    pub fn configure_device_resources(
        &mut self,
        resources: &DeviceResources,
        queue_format: QueueFormat,
    ) -> Result<(), AdminQueueError> {
        let cmd = AdminqCommand::ConfigureDeviceResources(ConfigureDeviceResourcesCommand {
            counter_array_addr: U64::new(resources.counter_array_addr),
            num_counters: U32::new(resources.num_counters),
            irq_db_addr: U64::new(resources.irq_db_addr),
            num_irq_dbs: U32::new(resources.num_irq_dbs),
            irq_db_stride: U32::new(resources.irq_db_stride),
            ntfy_blk_msix_base_idx: U32::new(resources.ntfy_blk_msix_base_idx),
            queue_format: queue_format as u8,
            padding: [0; 3],
        });
        self.execute_command(&cmd)
    }

    pub fn deconfigure_device_resources(&mut self) -> Result<(), AdminQueueError> {
        self.execute_command(&AdminqCommand::DeconfigureDeviceResources)
    }

    /// Registers a queue page list: the page bus addresses are marshalled
    /// big-endian into a scoped coherent buffer the device reads from.
    pub fn register_page_list(
        &mut self,
        page_list_id: u32,
        page_addrs: &[u64],
    ) -> Result<(), AdminQueueError> {
        let mut list = self.alloc_coherent(page_addrs.len() * 8)?;
        for (chunk, addr) in list.as_bytes_mut().chunks_exact_mut(8).zip(page_addrs) {
            chunk.copy_from_slice(&addr.to_be_bytes());
        }

        let cmd = AdminqCommand::RegisterPageList(RegisterPageListCommand {
            page_list_id: U32::new(page_list_id),
            num_pages: U32::new(page_addrs.len() as u32),
            page_address_list_addr: U64::new(list.bus_addr()),
        });
        self.execute_command(&cmd)
    }

    pub fn unregister_page_list(&mut self, page_list_id: u32) -> Result<(), AdminQueueError> {
        let cmd = AdminqCommand::UnregisterPageList(UnregisterPageListCommand {
            page_list_id: U32::new(page_list_id),
        });
        self.execute_command(&cmd)
    }

    fn create_tx_queue(
        &mut self,
        config: &DeviceConfig,
        params: &TxQueueParams,
    ) -> Result<(), AdminQueueError> {
        let mut create = CreateTxQueueCommand {
            queue_id: U32::new(params.queue_id),
            reserved: U32::new(0),
            queue_resources_addr: U64::new(params.queue_resources_addr),
            tx_ring_addr: U64::new(params.tx_ring_addr),
            queue_page_list_id: U32::new(0),
            ntfy_id: U32::new(params.ntfy_id),
            tx_comp_ring_addr: U64::new(0),
            tx_ring_size: U16::new(0),
            tx_comp_ring_size: U16::new(0),
            padding: [0; 4],
        };

        if config.queue_format.is_gqi() {
            let qpl_id = if config.queue_format == QueueFormat::GqiRda {
                RAW_ADDRESSING_QPL_ID
            } else {
                params.queue_page_list_id
            };
            create.queue_page_list_id = U32::new(qpl_id);
        } else {
            let (qpl_id, comp_ring_size) = if config.queue_format == QueueFormat::DqoRda {
                (RAW_ADDRESSING_QPL_ID, config.tx_comp_ring_entries)
            } else {
                (params.queue_page_list_id, config.tx_desc_count)
            };
            create.queue_page_list_id = U32::new(qpl_id);
            create.tx_ring_size = U16::new(config.tx_desc_count);
            create.tx_comp_ring_addr = U64::new(params.tx_comp_ring_addr);
            create.tx_comp_ring_size = U16::new(comp_ring_size);
        }

        self.issue_command(&AdminqCommand::CreateTxQueue(create))
    }

    /// Creates a batch of transmit queues with a single kick.
    pub fn create_tx_queues(
        &mut self,
        config: &DeviceConfig,
        queues: &[TxQueueParams],
    ) -> Result<(), AdminQueueError> {
        for params in queues {
            self.create_tx_queue(config, params)?;
        }
        self.kick_and_wait()
    }

    fn create_rx_queue(
        &mut self,
        config: &DeviceConfig,
        params: &RxQueueParams,
    ) -> Result<(), AdminQueueError> {
        let mut create = CreateRxQueueCommand {
            queue_id: U32::new(params.queue_id),
            index: U32::new(0),
            reserved: U32::new(0),
            ntfy_id: U32::new(params.ntfy_id),
            queue_resources_addr: U64::new(params.queue_resources_addr),
            rx_desc_ring_addr: U64::new(0),
            rx_data_ring_addr: U64::new(0),
            queue_page_list_id: U32::new(0),
            rx_ring_size: U16::new(0),
            packet_buffer_size: U16::new(0),
            rx_buff_ring_size: U16::new(0),
            enable_rsc: 0,
            padding1: 0,
            header_buffer_size: U16::new(0),
            padding2: [0; 2],
        };

        if config.queue_format.is_gqi() {
            let qpl_id = if config.queue_format == QueueFormat::GqiRda {
                RAW_ADDRESSING_QPL_ID
            } else {
                params.queue_page_list_id
            };
            create.rx_desc_ring_addr = U64::new(params.rx_desc_ring_addr);
            create.rx_data_ring_addr = U64::new(params.rx_data_ring_addr);
            create.index = U32::new(params.queue_id);
            create.queue_page_list_id = U32::new(qpl_id);
            create.packet_buffer_size = U16::new(params.packet_buffer_size);
        } else {
            let (qpl_id, buff_ring_entries) = if config.queue_format == QueueFormat::DqoRda {
                (RAW_ADDRESSING_QPL_ID, config.rx_buff_ring_entries)
            } else {
                (params.queue_page_list_id, config.rx_desc_count)
            };
            create.queue_page_list_id = U32::new(qpl_id);
            create.rx_ring_size = U16::new(config.rx_desc_count);
            create.rx_desc_ring_addr = U64::new(params.rx_desc_ring_addr);
            create.rx_data_ring_addr = U64::new(params.rx_data_ring_addr);
            create.packet_buffer_size = U16::new(config.packet_buffer_size);
            create.rx_buff_ring_size = U16::new(buff_ring_entries);
            create.enable_rsc = params.enable_rsc as u8;
            if config.header_split_enabled {
                create.header_buffer_size = U16::new(config.header_buffer_size);
            }
        }

        self.issue_command(&AdminqCommand::CreateRxQueue(create))
    }

    /// Creates a batch of receive queues with a single kick.
    pub fn create_rx_queues(
        &mut self,
        config: &DeviceConfig,
        queues: &[RxQueueParams],
    ) -> Result<(), AdminQueueError> {
        for params in queues {
            self.create_rx_queue(config, params)?;
        }
        self.kick_and_wait()
    }

    /// Destroys a batch of transmit queues with a single kick.
    pub fn destroy_tx_queues(&mut self, queue_ids: &[u32]) -> Result<(), AdminQueueError> {
        for &queue_id in queue_ids {
            let cmd = AdminqCommand::DestroyTxQueue(DestroyTxQueueCommand {
                queue_id: U32::new(queue_id),
            });
            self.issue_command(&cmd)?;
        }
        self.kick_and_wait()
    }

    /// Destroys a batch of receive queues with a single kick.
    pub fn destroy_rx_queues(&mut self, queue_ids: &[u32]) -> Result<(), AdminQueueError> {
        for &queue_id in queue_ids {
            let cmd = AdminqCommand::DestroyRxQueue(DestroyRxQueueCommand {
                queue_id: U32::new(queue_id),
            });
            self.issue_command(&cmd)?;
        }
        self.kick_and_wait()
    }

    pub fn set_mtu(&mut self, mtu: u64) -> Result<(), AdminQueueError> {
        let cmd = AdminqCommand::SetDriverParameter(SetDriverParameterCommand {
            parameter_type: U32::new(DRIVER_PARAMETER_MTU),
            reserved: U32::new(0),
            parameter_value: U64::new(mtu),
        });
        self.execute_command(&cmd)
    }

    /// Asks the device to write statistics into a caller-owned report region,
    /// refreshed every `interval` device ticks.
    pub fn report_stats(
        &mut self,
        stats_report_addr: u64,
        stats_report_len: u64,
        interval: u64,
    ) -> Result<(), AdminQueueError> {
        let cmd = AdminqCommand::ReportStats(ReportStatsCommand {
            stats_report_len: U64::new(stats_report_len),
            stats_report_addr: U64::new(stats_report_addr),
            interval: U64::new(interval),
        });
        self.execute_command(&cmd)
    }

    /// Queries the device's link speed in bits per second.
    pub fn report_link_speed(&mut self) -> Result<u64, AdminQueueError> {
        let region = self.alloc_coherent(8)?;
        let cmd = AdminqCommand::ReportLinkSpeed(ReportLinkSpeedCommand {
            link_speed_address: U64::new(region.bus_addr()),
        });
        self.execute_command(&cmd)?;

        let mut raw = [0u8; 8];
        raw.copy_from_slice(&region.as_bytes()[..8]);
        Ok(u64::from_be_bytes(raw))
    }

    /// Fetches the packet-type lookup table used to interpret receive descriptors.
    pub fn get_ptype_map(&mut self) -> Result<Vec<PacketType>, AdminQueueError> {
        let map_len = NUM_PTYPES * 2;
        let region = self.alloc_coherent(map_len)?;
        let cmd = AdminqCommand::GetPtypeMap(GetPtypeMapCommand {
            ptype_map_len: U64::new(map_len as u64),
            ptype_map_addr: U64::new(region.bus_addr()),
        });
        self.execute_command(&cmd)?;

        let table = region.as_bytes()[..map_len]
            .chunks_exact(2)
            .map(|entry| PacketType { l3_type: entry[0], l4_type: entry[1] })
            .collect();
        Ok(table)
    }

    /// Hands the device a driver-compatibility blob to inspect.
    pub fn verify_driver_compatibility(
        &mut self,
        driver_info: &[u8],
    ) -> Result<(), AdminQueueError> {
        let mut region = self.alloc_coherent(driver_info.len())?;
        region.as_bytes_mut()[..driver_info.len()].copy_from_slice(driver_info);

        let cmd = AdminqCommand::VerifyDriverCompatibility(VerifyDriverCompatibilityCommand {
            driver_info_len: U64::new(driver_info.len() as u64),
            driver_info_addr: U64::new(region.bus_addr()),
        });
        self.execute_command(&cmd)
    }

    /// Pushes the RSS key and indirection table to the device.
    pub fn configure_rss(&mut self, rss: &RssConfig) -> Result<(), AdminQueueError> {
        let key = rss.key();
        let indir = rss.indirection_table();

        let mut key_buffer = None;
        if !key.is_empty() {
            let mut buffer = self.alloc_coherent(key.len())?;
            buffer.as_bytes_mut()[..key.len()].copy_from_slice(key);
            key_buffer = Some(buffer);
        }

        let mut indir_buffer = None;
        if !indir.is_empty() {
            let mut buffer = self.alloc_coherent(indir.len() * 4)?;
            for (chunk, entry) in buffer.as_bytes_mut().chunks_exact_mut(4).zip(indir) {
                chunk.copy_from_slice(&entry.to_be_bytes());
            }
            indir_buffer = Some(buffer);
        }

        let hash_types =
            RssHashTypes::TCPV4 | RssHashTypes::UDPV4 | RssHashTypes::TCPV6 | RssHashTypes::UDPV6;
        let cmd = AdminqCommand::ConfigureRss(ConfigureRssCommand {
            hash_types: U16::new(hash_types.bits()),
            hash_algorithm: rss.algorithm() as u8,
            reserved: 0,
            hash_key_size: U16::new(key.len() as u16),
            indirection_table_size: U16::new(indir.len() as u16),
            hash_key_addr: U64::new(key_buffer.as_ref().map_or(0, |b| b.bus_addr())),
            indirection_table_addr: U64::new(indir_buffer.as_ref().map_or(0, |b| b.bus_addr())),
        });
        self.execute_command(&cmd)
    }

    /// Installs one flow rule on the firmware side.
    pub fn add_flow_rule(&mut self, rule: &FlowRule) -> Result<(), AdminQueueError> {
        let cmd = ConfigureFlowRuleCommand {
            operation: U16::new(FlowRuleOperation::Add as u16),
            location: U16::new(rule.location),
            rule: rule.to_wire(),
        };
        self.execute_extended_command(CommandOpcode::ConfigureFlowRule, cmd.as_bytes())
    }

    /// Removes the flow rule at `location` on the firmware side.
    pub fn delete_flow_rule(&mut self, location: u16) -> Result<(), AdminQueueError> {
        let cmd = ConfigureFlowRuleCommand {
            operation: U16::new(FlowRuleOperation::Remove as u16),
            location: U16::new(location),
            rule: FlowRuleWire::new_zeroed(),
        };
        self.execute_extended_command(CommandOpcode::ConfigureFlowRule, cmd.as_bytes())
    }

    /// Clears the firmware's entire flow rule table.
    pub fn reset_flow_rules(&mut self) -> Result<(), AdminQueueError> {
        let cmd = ConfigureFlowRuleCommand {
            operation: U16::new(FlowRuleOperation::Reset as u16),
            location: U16::new(0),
            rule: FlowRuleWire::new_zeroed(),
        };
        self.execute_extended_command(CommandOpcode::ConfigureFlowRule, cmd.as_bytes())
    }
}
