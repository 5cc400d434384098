/*!
    structs and consts for the registers in a standard slave's RAM used by this master. This should be used instead of any hardcoded register value.

    The goal of this file is to gather all physical memory registers at one place, so what you see here is exactly what you can expect in a slave.

    Some registers are partially redundant, this is because we can use some field pointing to a big struct and other fields pointing to only parts of the same struct.
*/

use bilge::prelude::*;
use crate::data::{self, Field};

pub mod address {
    use super::*;

    /// register of the station address, aka the fixed slave address
    /// ETG.1000.4 table 32
    pub const fixed: Field<u16> = Field::simple(0x0010);
    /// slave address alias
    /// ETG.1000.4 table 32
    pub const alias: Field<u16> = Field::simple(0x0012);
}

/// features supported by the slave's controller
/// ETG.1000.4 table 31
pub const esc_features: Field<EscFeatures> = Field::simple(0x0008);

pub mod dl {
    use super::*;

	pub const status: Field<DLStatus> = Field::simple(0x0110);
}

pub mod al {
    use super::*;

    pub const control: Field<AlControl> = Field::simple(0x0120);
    pub const status: Field<AlStatus> = Field::simple(0x0130);
    /// code explaining the last state transition failure, to be converted into [AlError]
    pub const error: Field<u16> = Field::simple(0x0134);
}

/// Slave Information Interface, the access to the slave's EEPROM
pub mod sii {
    use super::*;

	pub const access: Field<SiiAccess> = Field::simple(0x0500);
	pub const control: Field<SiiControl> = Field::simple(0x0502);
	/// word address in the EEPROM
	pub const address: Field<u32> = Field::simple(0x0504);
	/// data read (4 bytes) or to write (2 bytes)
	pub const data: Field<u32> = Field::simple(0x0508);
	pub const data_write: Field<u16> = Field::simple(0x0508);
}

/// whole area of FMMU entries, used to clear them all at once
pub const fmmu_area: Field<[u8; 0x100]> = Field::simple(0x0600);
pub const fmmu: FMMU = FMMU {address: 0x0600, num: 16};
/// whole area of sync manager channels, used to clear them all at once
pub const sync_manager_area: Field<[u8; 0x80]> = Field::simple(0x0800);

pub mod sync_manager {
    use super::*;

	pub const interface: SyncManager = SyncManager {address: 0x0800, num: 16};
}

/// distributed clock registers
/// ETG.1000.4 table 60
pub mod dc {
    use super::*;

    /**
        A write access to port 0 latches the local time (in ns) at receive begin on each port of this PDU in this parameter (if the PDU was received correctly).
        This array contains the latched receival time on each port, as 4 u32
    */
    pub const received_time: Field<[u8; 16]> = Field::simple(0x0900);
    pub const received_time_port0: Field<u32> = Field::simple(0x0900);
    /// local copy of the system time
    pub const system_time: Field<u64> = Field::simple(0x0910);
    /// Local time (in ns) at receive begin at the processing unit of a PDU containing a write access to Receive time port 0
    pub const receive_time_unit: Field<u64> = Field::simple(0x0918);
    /// Offset between the local time (in ns) and the local system time (in ns)
    pub const system_offset: Field<u64> = Field::simple(0x0920);
    /// Offset between the reference system time (in ns) and the local system time (in ns)
    pub const system_delay: Field<u32> = Field::simple(0x0928);
    /// assignment of the cyclic unit to ethercat or PDI
    pub const cycle_unit_control: Field<u8> = Field::simple(0x0980);
    /// activation of the cyclic unit and sync signals, see [SyncActivation]
    pub const sync_activation: Field<u8> = Field::simple(0x0981);
    /// system time of the first sync0 pulse
    pub const start_time: Field<u64> = Field::simple(0x0990);
    /// time between two sync0 pulses (ns)
    pub const sync0_cycle: Field<u32> = Field::simple(0x09A0);
    /// time between sync0 and sync1 pulses (ns)
    pub const sync1_cycle: Field<u32> = Field::simple(0x09A4);
}

/// values for [dc::sync_activation]
pub struct SyncActivation;
impl SyncActivation {
    pub const OFF: u8 = 0;
    /// cyclic unit and sync0
    pub const SYNC0: u8 = 0b011;
    /// cyclic unit, sync0 and sync1
    pub const SYNC01: u8 = 0b111;
}


/**
    control register of the slave communication state, written by the master to request a state change

    ETG.1000.6 table 9
*/
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq)]
pub struct AlControl {
    /// requested state of communication
    pub state: AlState,
    /// acknowledge the error flag of [AlStatus]
    pub ack: bool,
    /// request of id instead of error code in [al::error]
    pub request_id: bool,
    reserved: u10,
}
data::bilge_pdudata!(AlControl, u16);

/// ETG.1000.6 table 12
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq)]
pub struct AlStatus {
    /// current state of communication
    pub state: AlState,
    /// true if the last requested transition failed, the reason is in [al::error]
    pub error: bool,
    reserved: u11,
}
data::bilge_pdudata!(AlStatus, u16);

/**
    the current operation state on one device.

    Except [Self::Bootstrap], changing to any mode can be requested from any upper mode or from the preceding one.
    States are ordered, so the lowest state of several slaves can be computed with `min`.

    ETG.1000.6 table 9
*/
#[bitsize(4)]
#[derive(FromBits, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum AlState {
    /// state not read yet, or a value no slave should report
    #[fallback]
    Unknown = 0,
    /**
        The init mode allows to set many communication registers, like the salve address, the mailbox setup, etc.

        This mode should be used at the beginning of a communication. Only registers can be used.
    */
    Init = 1,
    /**
        the pre operational mode allows mailbox communication, which is mendatory to configure some slaves before realtime operations. Most functions are enabled but not realtime.
    */
    PreOperational = 2,
    /**
        Transitional state used for firmware updates.

        It cannot be requested, nor changed while it is active.
    */
    Bootstrap = 3,
    /**
        Mode allowing realtime operations, except that commands sent to the slaves via its mapping will not be executed.

        Mapping is no more allowed in this state, nor communication setup via registers.
    */
    SafeOperational = 4,
    /**
        Realtime operations running

        The master has full access to the slave's effector functions. slaves might expect the master to regularly refresh its commands.
    */
    Operational = 8,
}

data::status_codes! {
    /// reason of a failed state transition, read from [al::error]
    ///
    /// ETG.1000.6 table 11
    pub enum AlError: u16 {
        NoError = 0x0000 => "no error",
        Unspecified = 0x0001 => "unspecified error",
        NoMemory = 0x0002 => "no memory",
        InvalidRequestedStateChange = 0x0011 => "invalid requested state change",
        UnknownRequestedState = 0x0012 => "unknown requested state",
        BootstrapNotSupported = 0x0013 => "bootstrap not supported",
        NoValidFirmware = 0x0014 => "no valid firmware",
        InvalidMailboxConfiguration = 0x0015 => "invalid mailbox configuration",
        InvalidMailboxConfigurationPreop = 0x0016 => "invalid mailbox configuration (pre-operational)",
        InvalidSyncManagerConfiguration = 0x0017 => "invalid sync manager configuration",
        NoValidInputs = 0x0018 => "no valid inputs available",
        NoValidOutputs = 0x0019 => "no valid outputs",
        Synchronization = 0x001A => "synchronization error",
        SyncManagerWatchdog = 0x001B => "sync manager watchdog",
        InvalidSyncManagerTypes = 0x001C => "invalid sync manager types",
        InvalidOutputConfiguration = 0x001D => "invalid output configuration",
        InvalidInputConfiguration = 0x001E => "invalid input configuration",
        InvalidWatchdogConfiguration = 0x001F => "invalid watchdog configuration",
        NeedColdStart = 0x0020 => "slave needs cold start",
        NeedInit = 0x0021 => "slave needs init",
        NeedPreop = 0x0022 => "slave needs pre-operational",
        NeedSafeop = 0x0023 => "slave needs safe-operational",
        InvalidInputMapping = 0x0024 => "invalid input mapping",
        InvalidOutputMapping = 0x0025 => "invalid output mapping",
        InconsistentSettings = 0x0026 => "inconsistent settings",
        FreerunNotSupported = 0x0027 => "freerun not supported",
        SynchronizationNotSupported = 0x0028 => "synchronization not supported",
        FreerunNeedsThreeBuffers = 0x0029 => "freerun needs 3 buffer mode",
        BackgroundWatchdog = 0x002A => "background watchdog",
        NoValidInputsOutputs = 0x002B => "no valid inputs and outputs",
        FatalSync = 0x002C => "fatal sync error",
        NoSync = 0x002D => "no sync error",
        InvalidDcSync = 0x0030 => "invalid DC sync configuration",
        InvalidDcLatch = 0x0031 => "invalid DC latch configuration",
        Pll = 0x0032 => "PLL error",
        DcSyncIo = 0x0033 => "DC sync IO error",
        DcSyncTimeout = 0x0034 => "DC sync timeout error",
        DcInvalidSyncCycle = 0x0035 => "DC invalid sync cycle time",
        DcInvalidSync0Cycle = 0x0036 => "DC invalid sync0 cycle time",
        DcInvalidSync1Cycle = 0x0037 => "DC invalid sync1 cycle time",
        MailboxAoe = 0x0041 => "mailbox AoE error",
        MailboxEoe = 0x0042 => "mailbox EoE error",
        MailboxCoe = 0x0043 => "mailbox CoE error",
        MailboxFoe = 0x0044 => "mailbox FoE error",
        MailboxSoe = 0x0045 => "mailbox SoE error",
        MailboxVoe = 0x004F => "mailbox VoE error",
        EepromNoAccess = 0x0050 => "EEPROM no access",
        Eeprom = 0x0051 => "EEPROM error",
        RestartedLocally = 0x0060 => "slave restarted locally",
        DeviceIdentificationUpdated = 0x0061 => "device identification value updated",
        ApplicationControllerAvailable = 0x00F0 => "application controller available",
    }
}

/// ETG.1000.4 table 31
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub struct EscFeatures {
    pub fmmu_bit_operation: bool,
    reserved: u1,
    /// the slave has a distributed clock
    pub distributed_clock: bool,
    /// the distributed clock registers are 64 bits wide
    pub dc_64bit: bool,
    pub low_jitter: bool,
    reserved: u11,
}
data::bilge_pdudata!(EscFeatures, u16);

/// ETG.1000.4 table 34
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub struct DLStatus {
	/// true if operational
	pub pdi_operational: bool,
	/// true if watchdog not expired
	pub pdi_watchdog: bool,
	/// true if activated for at least one port
	pub extended_link_detection: bool,
	reserved: u1,
	/// physical link on each port
	pub link_port0: bool,
	pub link_port1: bool,
	pub link_port2: bool,
	pub link_port3: bool,
	/// forwarding on the same port i.e. loop back, and communication established on each port
	pub loop_port0: bool,
	pub communication_port0: bool,
	pub loop_port1: bool,
	pub communication_port1: bool,
	pub loop_port2: bool,
	pub communication_port2: bool,
	pub loop_port3: bool,
	pub communication_port3: bool,
}
data::bilge_pdudata!(DLStatus, u16);

impl DLStatus {
    /// true if frames are forwarded to an other slave through the given port
    pub fn port_active(&self, port: u8) -> bool {
        let (looped, communication) = match port {
            0 => (self.loop_port0(), self.communication_port0()),
            1 => (self.loop_port1(), self.communication_port1()),
            2 => (self.loop_port2(), self.communication_port2()),
            3 => (self.loop_port3(), self.communication_port3()),
            _ => return false,
        };
        communication && ! looped
    }
    /// the 4 ports activities
    pub fn ports(&self) -> [bool; 4] {
        [0u8, 1, 2, 3].map(|port| self.port_active(port))
    }
}

/// ETG.1000.4 table 48
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub struct SiiAccess {
	pub owner: SiiOwner,
	/// setting this will reset access to SII
	pub lock: bool,
	reserved: u6,
	/// PDI access active
	pub pdi: bool,
	reserved: u7,
}
data::bilge_pdudata!(SiiAccess, u16);

#[bitsize(1)]
#[derive(FromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum SiiOwner {
	EthercatDL = 0,
	Pdi = 1,
}

/**
    register controling the read/write operations to Slave Information Interface (SII)

	ETG.1000.4 table 49
*/
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub struct SiiControl {
	/// true if SII is writable
	pub write_access: bool,
	reserved: u4,
	/// DL-user emulates SII, cannot be set by the master
	pub eeprom_emulation: bool,
	/// number of bytes per read transaction, cannot be set by master
	pub read_size: SiiTransaction,
	/// unit of SII addresses, cannot be set by master
	pub address_unit: SiiUnit,

	/**
		read operation requested (parameter write) or read operation busy (parameter read)
		To start a new read operation there must be a positive edge on this parameter
	*/
	pub read_operation: bool,
	/**
		write operation requested (parameter write) or write operation busy (parameter read)
		To start a new write operation there must be a positive edge on this parameter
	*/
	pub write_operation: bool,
	/// reload operation requested (parameter write) or reload operation busy (parameter read)
	pub reload_operation: bool,

	/// checksum error while reading at startup
	pub checksum_error: bool,
	/// error on reading Device Information
	pub device_info_error: bool,
	/// error on last SII request, the slave did not acknowledge the command
	pub command_error: bool,
	/// error on last write operation
	pub write_error: bool,

	/// operation is ongoing
	pub busy: bool,
}
data::bilge_pdudata!(SiiControl, u16);

impl SiiControl {
    /// true if any error flag is set
    pub fn error(&self) -> bool {
        self.checksum_error() || self.device_info_error() || self.command_error() || self.write_error()
    }
    /// a control value requesting a read
    pub fn read() -> Self {
        let mut control = Self::from(0u16);
        control.set_read_operation(true);
        control
    }
    /// a control value requesting a write
    pub fn write() -> Self {
        let mut control = Self::from(0u16);
        control.set_write_access(true);
        control.set_write_operation(true);
        control
    }
}

#[bitsize(1)]
#[derive(FromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum SiiTransaction {
	Bytes4 = 0,
	Bytes8 = 1,
}
#[bitsize(1)]
#[derive(FromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum SiiUnit {
	Byte = 0,
	Word = 1,
}

/// this is not a PduData but a struct transporting the address and number of FMMU registers
/// ETG.1000.4 table 57
pub struct FMMU {
    /// address of the first entry
	pub address: u16,
	/// number of entries
	pub num: u8,
}

impl FMMU {
    /// return an entry of the FMMU
    pub const fn entry(&self, index: u8) -> Field<FmmuEntry>  {
        Field::simple(self.address as usize + index as usize * 0x10)
    }
}

/**
	The fieldbus memory management unit (FMMU) converts logical addresses into physical addresses. Thus, FMMUs allow one to use logical addressing for data segments that span several slave devices: one PDU addresses data within several arbitrarily distributed devices.

	Each FMMU entity describes one memory translation between the logical memory of the EtherCAT communication network and the physical memory of the slave.

	ETG.1000.4 table 56
*/
#[bitsize(128)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub struct FmmuEntry {
	/// start byte in the logical memory
	pub logical_start_byte: u32,
	/// byte size of the data
	pub logical_len_byte: u16,
	/// offset of the start bit in the logical start byte
	pub logical_start_bit: u3,
	reserved: u5,
	/// offset of the end bit in the logical end byte
	pub logical_end_bit: u3,
	reserved: u5,

	/// start byte in the physical memory (set by the sync manager)
	pub physical_start_byte: u16,
	/// start bit in the physical start byte
	pub physical_start_bit: u3,
	reserved: u5,

	/// entity will be used for read service
	pub read: bool,
	/// entity will be used for write service
	pub write: bool,
	reserved: u6,

	/// enable this FMMU entry, so physical memory will be copied from/to logical memory on read/write
	pub enable: bool,
	reserved: u7,
	reserved: u24,
}
data::bilge_pdudata!(FmmuEntry, u128);

/// this is not a PduData but a convenience struct transporting the addresses of a sync manager
/// ETG.1000.4 table 59
pub struct SyncManager {
    /// start address of the sync manager (address of the first channel)
    pub address: u16,
    /// number of channels
    pub num: u8,
}

impl SyncManager {
    pub const fn channel(&self, index: u8) -> Field<SyncManagerChannel> {
        Field::simple(self.address as usize + index as usize * 8)
    }
    /// status byte of a channel, see [SyncManagerChannel::mailbox_full]
    pub const fn status(&self, index: u8) -> Field<u8> {
        Field::simple(self.address as usize + index as usize * 8 + 5)
    }
    /// activation byte of a channel, holding [SyncManagerChannel::enable] and [SyncManagerChannel::repeat]
    pub const fn activate(&self, index: u8) -> Field<u8> {
        Field::simple(self.address as usize + index as usize * 8 + 6)
    }
    /// PDI control byte of a channel, holding [SyncManagerChannel::repeat_ack]
    pub const fn pdi_control(&self, index: u8) -> Field<u8> {
        Field::simple(self.address as usize + index as usize * 8 + 7)
    }
    /// the sync manager channel reserved for mailbox in
    pub const fn mailbox_write(&self) -> Field<SyncManagerChannel>   {self.channel(0)}
    /// the sync manager channel reserved for mailbox out
    pub const fn mailbox_read(&self) -> Field<SyncManagerChannel>   {self.channel(1)}
    /// one of the sync manager channels reserved for mapping, 0 for outputs, 1 for inputs
    pub const fn mappable(&self, index: u8) -> Field<SyncManagerChannel>   {self.channel(2+index)}
}

/// mask of [SyncManagerChannel::mailbox_full] in [SyncManager::status]
pub const MAILBOX_FULL: u8 = 0b1000;
/// mask of [SyncManagerChannel::repeat] in [SyncManager::activate]
pub const SYNC_REPEAT: u8 = 0b10;
/// mask of [SyncManagerChannel::repeat_ack] in [SyncManager::pdi_control]
pub const SYNC_REPEAT_ACK: u8 = 0b10;

/**
    The Sync manager controls the access to the DL-user memory. Each channel defines a consistent area of the DL-user memory.

    There is two ways of data exchange between master and PDI:
    - Handshake mode (mailbox): one entity fills data in and cannot access the area until the other entity reads out the data.
    - Buffered mode: the interaction between both producer of data and consumer of data is uncorrelated, each entity expects access at any time, always providing the consumer with the newest data.

    ETG.1000.4 table 58
*/
#[bitsize(64)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub struct SyncManagerChannel {
    /// start address in octets in the physical memory of the consistent DL-user memory area.
    pub address: u16,
    /// size in octets of the consistent DL -user memory area.
    pub length: u16,
    /// whether the buffer is used for mailbox or exchange through mapping to the logical memory
    pub mode: SyncMode,
    /// whether the consistent DL -user memory area is read or written by the master.
    pub direction: SyncDirection,

    /// an event is generated if there is new data available in the consistent DL-user memory area which was written by the master (direction write) or if the new data from the DL-user was read by the master (direction read).
    pub ec_event: bool,
    /// an event is generated if there is new data available in the consistent DL-user memory area which was written by DLS-user or if the new data from the Master was read by the DLS-user.
    pub dls_user_event: bool,
    /// if the monitoring of an access to the consistent DL-user memory area is enabled.
    pub watchdog: bool,
    reserved: u1,
    /// if the consistent DL -user memory (direction write) has been written by the master and the event enable parameter is set.
    pub write_event: bool,
    /// if the consistent DL -user memory (direction read) has been read by the master and the event enable parameter is set.
    pub read_event: bool,
    reserved: u1,

    /// true if there is data waiting to be read (by master or slave) in the buffer
    pub mailbox_full: bool,
    /// state (buffer number, locked) of the consistent DL-user memory if it is of buffered access type.
    pub buffer_state: u2,
    pub read_buffer_open: bool,
    pub write_buffer_open: bool,

    /// activate this channel
    pub enable: bool,
    /// A change in this parameter indicates a repeat request. This is primarily used to repeat the last mailbox interactions.
    pub repeat: bool,
    reserved: u4,

    /// if the DC 0 Event shall be invoked in case of a EtherCAT write
    pub dc_event_bus: bool,
    /// if the DC 0 Event shall be invoked in case of a local write
    pub dc_event_local: bool,
    /// disable this channel for PDI access
    pub disable_pdi: bool,
    /// indicates a repeat request acknowledge. After setting the value of Repeat in the parameter repeat acknowledge.
    pub repeat_ack: bool,
    reserved: u6,
}
data::bilge_pdudata!(SyncManagerChannel, u64);

impl SyncManagerChannel {
    /// an enabled channel configuration
    pub fn configured(address: u16, length: u16, mode: SyncMode, direction: SyncDirection) -> Self {
        let mut channel = Self::from(0u64);
        channel.set_address(address);
        channel.set_length(length);
        channel.set_mode(mode);
        channel.set_direction(direction);
        channel.set_dls_user_event(true);
        channel.set_enable(true);
        channel
    }
}

/// ETG.1000.4 table 58
#[bitsize(2)]
#[derive(FromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum SyncMode {
    Buffered = 0,
    Mailbox = 2,
    #[fallback]
    Reserved = 3,
}
/// ETG.1000.4 table 58
#[bitsize(2)]
#[derive(FromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum SyncDirection {
    /// sync manager buffer is read by the master
    Read = 0,
    /// sync manager buffer is written by the master
    Write = 1,
    #[fallback]
    Reserved = 3,
}
