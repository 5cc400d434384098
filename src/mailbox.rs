/*!
    implementation of the mailbox exchanges with a slave, on top of which the mailbox protocols (CoE, SoE, ...) are built.

    ETG.1000.4 5.6
*/

use std::sync::Arc;
use core::time::Duration;
use tokio::time::Instant;
use bilge::prelude::*;
use log::{debug, trace};

use crate::{
	rawmaster::{RawMaster, PduCommand, SlaveAddress},
	registers,
	config::PollBackoff,
    data::{self, PduData, Cursor},
    error::{EthercatError, EthercatResult},
	};


/// size of the header prefixing every mailbox frame
pub const MAILBOX_HEADER: usize = 6;

/**
    implementation of communication with a slave's mailbox

    The mailbox is made of 2 buffers in the slave memory, handled by the sync managers 0 (master to slave) and 1 (slave to master). A request is written when the slave's buffer is empty, an answer is read when the slave's buffer is full.

    Every mailbox frame carries a counter rolling from 1 to 7, allowing the slave to detect repeated frames.
*/
pub struct Mailbox {
    master: Arc<RawMaster>,
	slave: u16,
	/// offset and size of the buffer master to slave
	write: (u16, u16),
	/// offset and size of the buffer slave to master
	read: (u16, u16),
	backoff: PollBackoff,
	count: u8,
	/// current value of the repeat flag toggled for retries
	repeat: bool,
}

impl Mailbox {
    pub fn new(master: Arc<RawMaster>, slave: u16, write: (u16, u16), read: (u16, u16), backoff: PollBackoff) -> Self {
        Self {master, slave, write, read, backoff, count: 0, repeat: false}
    }
    /// fixed address of the slave owning this mailbox
    pub fn slave(&self) -> u16 {self.slave}
    /// maximum data size in a mailbox frame sent to the slave
    pub fn capacity(&self) -> usize {usize::from(self.write.1).saturating_sub(MAILBOX_HEADER)}
    /// maximum data size in a mailbox frame received from the slave
    pub fn read_capacity(&self) -> usize {usize::from(self.read.1).saturating_sub(MAILBOX_HEADER)}

    fn address(&self) -> SlaveAddress {SlaveAddress::Fixed(self.slave)}

    /// wait for the given sync manager status to have the given mailbox full flag
    async fn wait_full(&self, channel: u8, full: bool, deadline: Instant) -> EthercatResult<bool> {
        let mut delay = self.backoff.start();
        loop {
            let status = self.master.fprd(self.slave, registers::sync_manager::interface.status(channel)).await?;
            if status.answers == 1 && (status.value & registers::MAILBOX_FULL != 0) == full
                {return Ok(true)}
            if ! self.backoff.wait(&mut delay, deadline).await
                {return Ok(false)}
        }
    }

    /// true if the slave has a message waiting to be read
    pub async fn available(&self) -> EthercatResult<bool> {
        let status = self.master.fprd(self.slave, registers::sync_manager::interface.status(1)).await?.one()?;
        Ok(status & registers::MAILBOX_FULL != 0)
    }

	/**
        write the given frame in the mailbox

        waits for the slave to have read the previous frame, no longer than `timeout`
    */
	pub async fn write(&mut self, ty: MailboxType, data: &[u8], timeout: Duration) -> EthercatResult<(), MailboxError> {
        let deadline = Instant::now() + timeout;
        if data.len() > self.capacity()
            {return Err(EthercatError::Master("data too big for the slave mailbox"))}
        self.count = (self.count % 7) + 1;

        let mut buffer = vec![0; usize::from(self.write.1)];
        let mut cursor = Cursor::new(buffer.as_mut_slice());
        cursor.pack(&MailboxHeader {
            length: data.len() as u16,
            // address of master
            address: 0,
            flags: MailboxFlags::new(u6::new(0), u2::new(0), ty, u3::new(self.count)),
            })?;
        cursor.write(data)?;

        if ! self.wait_full(0, false, deadline).await?
            {return Err(EthercatError::Timeout("slave mailbox stays full"))}
        // the whole buffer is written, so the sync manager considers the frame complete
        let mut delay = self.backoff.start();
        loop {
            let remain = deadline.saturating_duration_since(Instant::now()).max(self.master.timeout());
            let answers = self.master.pdu(PduCommand::FPWR, self.slave, self.write.0, &mut buffer, remain).await?;
            if answers == 1 {
                trace!("slave {:#x}: mailbox {:?} sent, {} bytes, count {}", self.slave, ty, data.len(), self.count);
                return Ok(());
            }
            if ! self.backoff.wait(&mut delay, deadline).await
                {return Err(EthercatError::Timeout("mailbox write not acknowledged"))}
        }
	}

	/**
        read the frame currently in the mailbox, wait for it if not already present, no longer than `timeout`

        returns the frame type and its content. Exception frames sent by the slave are reported as errors.
    */
	pub async fn read(&mut self, timeout: Duration) -> EthercatResult<(MailboxType, Vec<u8>), MailboxError> {
        let deadline = Instant::now() + timeout;
        if ! self.wait_full(1, true, deadline).await?
            {return Err(EthercatError::Timeout("no mailbox answer"))}

        let mut buffer = vec![0; usize::from(self.read.1)];
        let mut delay = self.backoff.start();
        loop {
            let remain = deadline.saturating_duration_since(Instant::now()).max(self.master.timeout());
            let answers = self.master.pdu(PduCommand::FPRD, self.slave, self.read.0, &mut buffer, remain).await?;
            if answers == 1 {break}
            // the frame read may be lost, ask the slave to put it back in the buffer
            debug!("slave {:#x}: mailbox read lost, requesting repeat", self.slave);
            self.request_repeat(deadline).await?;
            if ! self.backoff.wait(&mut delay, deadline).await
                {return Err(EthercatError::Timeout("mailbox read not acknowledged"))}
        }

        let mut cursor = Cursor::new(buffer.as_slice());
        let header = cursor.unpack::<MailboxHeader>()?;
        let content = cursor.read(usize::from(header.length))
            .map_err(|_| EthercatError::<MailboxError>::Protocol("mailbox frame longer than mailbox"))?;
        let ty = header.flags.ty();
        trace!("slave {:#x}: mailbox {:?} received, {} bytes", self.slave, ty, content.len());
        if ty == MailboxType::Exception {
            let detail = Cursor::new(content).unpack::<MailboxErrorFrame>()?;
            return Err(EthercatError::Slave(self.address(), MailboxError::from(detail.detail())));
        }
        Ok((ty, content.to_vec()))
	}

	/// toggle the repeat flag of the read sync manager and wait for the slave acknowledge
	async fn request_repeat(&mut self, deadline: Instant) -> EthercatResult<(), MailboxError> {
        let interface = registers::sync_manager::interface;
        let activate = self.master.fprd(self.slave, interface.activate(1)).await?.one()?;
        self.repeat = ! self.repeat;
        let activate = if self.repeat {activate | registers::SYNC_REPEAT} else {activate & ! registers::SYNC_REPEAT};
        self.master.fpwr(self.slave, interface.activate(1), activate).await?.one()?;

        let mut delay = self.backoff.start();
        loop {
            let control = self.master.fprd(self.slave, interface.pdi_control(1)).await?;
            if control.answers == 1 && (control.value & registers::SYNC_REPEAT_ACK != 0) == self.repeat
                {return Ok(())}
            if ! self.backoff.wait(&mut delay, deadline).await
                {return Err(EthercatError::Timeout("mailbox repeat not acknowledged"))}
        }
	}
}


/// ETG 1000.4 table 29
// not a native integer size, so packed by hand around its flags
#[derive(Copy, Clone, Debug)]
pub struct MailboxHeader {
    /// length of the mailbox service data following this header
    pub length: u16,
    /**
        - if a master is client: Station Address of the source
        - if a slave is client: Station Address of the destination
    */
    pub address: u16,
    pub flags: MailboxFlags,
}
impl PduData for MailboxHeader {
    const ID: data::TypeId = data::TypeId::CUSTOM;
    type Packed = [u8; MAILBOX_HEADER];

    fn pack(&self, dst: &mut [u8]) -> data::PackingResult<()> {
        let mut cursor = Cursor::new(dst);
        cursor.pack(&self.length)?;
        cursor.pack(&self.address)?;
        cursor.pack(&self.flags)
    }
    fn unpack(src: &[u8]) -> data::PackingResult<Self> {
        let mut cursor = Cursor::new(src);
        Ok(Self {
            length: cursor.unpack()?,
            address: cursor.unpack()?,
            flags: cursor.unpack()?,
        })
    }
}

#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub struct MailboxFlags {
    /// reserved for future
    pub channel: u6,
    /// 0 is lowest priority, 3 is highest
    pub priority: u2,
    pub ty: MailboxType,
    /// Counter of the mailbox services (0 reserved, this should roll from 1 to 7 and overflow to 1 after 7)
    pub count: u3,
    reserved: u1,
}
data::bilge_pdudata!(MailboxFlags, u16);

/// ETG 1000.4 table 29
#[bitsize(4)]
#[derive(FromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum MailboxType {
    Exception = 0x0,
    Ads = 0x1,
    Ethernet = 0x2,
    Can = 0x3,
    File = 0x4,
    Servo = 0x5,
    Specific = 0xf,
    #[fallback]
    Reserved = 0x6,
}

/// ETG 1000.4 table 30
#[bitsize(32)]
#[derive(FromBits, DebugBits, Copy, Clone)]
struct MailboxErrorFrame {
    ty: u16,
    detail: u16,
}
data::bilge_pdudata!(MailboxErrorFrame, u32);

data::status_codes! {
    /// error reported by a slave about a mailbox frame it received
    ///
    /// ETG 1000.4 table 30
    pub enum MailboxError: u16 {
        Syntax = 0x1 => "syntax of 6 octet mailbox header is wrong",
        UnsupportedProtocol = 0x2 => "the mailbox protocol is not supported",
        InvalidChannel = 0x3 => "channel field contains wrong value",
        ServiceNotSupported = 0x4 => "the service in the mailbox protocol is not supported",
        InvalidHeader = 0x5 => "the mailbox protocol header of the mailbox protocol is wrong",
        SizeTooShort = 0x6 => "length of received mailbox data is too short",
        NoMoreMemory = 0x7 => "mailbox protocol can not be processed because of limited resources",
        InvalidSize = 0x8 => "the length of data is inconsistent",
        ServiceInWork = 0x9 => "mailbox service already in use",
    }
}
