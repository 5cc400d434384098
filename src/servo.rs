//! implementation of SoE (Servo drive profile over Ethercat)

use core::{fmt, time::Duration};
use bilge::prelude::*;
use log::debug;

use crate::{
    mailbox::{Mailbox, MailboxType, MailboxError},
    rawmaster::SlaveAddress,
    data::{self, PduData, Cursor},
    error::{EthercatError, EthercatResult},
    };


/// bytes before the data in a SoE frame
const SOE_OVERHEAD: usize = 4;

/// flags selecting the elements of an IDN to transfer, ETG.1000.6 5.8.2
pub mod elements {
    pub const DATA_STATE: u8 = 0x01;
    pub const NAME: u8 = 0x02;
    pub const ATTRIBUTE: u8 = 0x04;
    pub const UNIT: u8 = 0x08;
    pub const MIN: u8 = 0x10;
    pub const MAX: u8 = 0x20;
    pub const VALUE: u8 = 0x40;
    pub const DEFAULT: u8 = 0x80;
}

/**
    implementation of SoE (Servo drive profile over Ethercat)

    Parameters of a servo drive are named IDN and addressed by the drive number in the slave and the IDN number. Transfers too big for one mailbox frame are fragmented, each fragment but the last is marked incomplete.
*/
pub struct Servo<'a> {
    mailbox: &'a mut Mailbox,
}
impl<'a> Servo<'a> {
    pub fn new(mailbox: &'a mut Mailbox) -> Self {
        Self {mailbox}
    }

    /// read the elements of an IDN, reassembling fragments
    pub async fn read(&mut self, drive: u8, elements: u8, idn: u16, timeout: Duration) -> EthercatResult<Vec<u8>, ServoError> {
        let drive = drive_number(drive)?;
        let mut buffer = [0; SOE_OVERHEAD];
        let mut frame = Cursor::new(buffer.as_mut_slice());
        frame.pack(&SoeHeader::new(
                SoeOpcode::ReadRequest,
                false,
                false,
                drive,
                elements,
                idn,
            ))?;
        self.mailbox.write(MailboxType::Servo, frame.finish(), timeout).await?;

        let mut data = Vec::new();
        loop {
            let response = self.receive(idn, timeout).await?;
            let mut frame = Cursor::new(response.as_slice());
            let header = frame.unpack::<SoeHeader>()?;
            if header.opcode() != SoeOpcode::ReadResponse
            || header.drive() != drive
            || header.elements() != elements
                {return Err(EthercatError::Protocol("unexpected SoE answer"))}
            data.extend_from_slice(frame.remain());
            if ! header.incomplete()
                {return Ok(data)}
        }
    }

    /// write the elements of an IDN, fragmenting the data if needed
    pub async fn write(&mut self, drive: u8, elements: u8, idn: u16, data: &[u8], timeout: Duration) -> EthercatResult<(), ServoError> {
        let drive = drive_number(drive)?;
        let capacity = self.mailbox.capacity().saturating_sub(SOE_OVERHEAD);
        if capacity == 0
            {return Err(EthercatError::Master("slave mailbox too small for SoE transfer"))}

        let mut buffer = vec![0; self.mailbox.capacity()];
        let mut chunks = data.chunks(capacity);
        loop {
            let chunk = chunks.next().unwrap_or(&[]);
            let remaining = chunks.len();
            let incomplete = remaining != 0;
            let mut frame = Cursor::new(buffer.as_mut_slice());
            frame.pack(&SoeHeader::new(
                    SoeOpcode::WriteRequest,
                    incomplete,
                    false,
                    drive,
                    elements,
                    // fragmented frames carry the number of fragments left instead of the IDN
                    if incomplete {remaining as u16} else {idn},
                ))?;
            frame.write(chunk)?;
            self.mailbox.write(MailboxType::Servo, frame.finish(), timeout).await?;
            if ! incomplete {break}
        }

        let response = self.receive(idn, timeout).await?;
        let header = SoeHeader::unpack(&response)?;
        if header.opcode() != SoeOpcode::WriteResponse
        || header.drive() != drive
        || header.elements() != elements
            {return Err(EthercatError::Protocol("unexpected SoE answer"))}
        Ok(())
    }

    /// receive the next SoE frame, and report errors sent by the drive
    async fn receive(&mut self, idn: u16, timeout: Duration) -> EthercatResult<Vec<u8>, ServoError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remain = deadline.saturating_duration_since(tokio::time::Instant::now());
            let (ty, content) = self.mailbox.read(remain).await?;
            if ty != MailboxType::Servo {
                debug!("slave {:#x}: ignoring {:?} mailbox frame during SoE transfer", self.mailbox.slave(), ty);
                if tokio::time::Instant::now() >= deadline
                    {return Err(EthercatError::Timeout("no SoE answer"))}
                continue;
            }
            let header = SoeHeader::unpack(&content)?;
            if header.error() {
                // the error code ends the frame
                let code = content.len().checked_sub(2)
                    .filter(|&start| start >= SOE_OVERHEAD)
                    .map(|start| u16::from_le_bytes([content[start], content[start+1]]))
                    .ok_or(EthercatError::<ServoError>::Protocol("SoE error frame without error code"))?;
                debug!("slave {:#x}: SoE error {:#x} on idn {:#x}", self.mailbox.slave(), code, idn);
                return Err(EthercatError::Slave(SlaveAddress::Fixed(self.mailbox.slave()), ServoError::Idn(code)));
            }
            return Ok(content);
        }
    }
}

fn drive_number(drive: u8) -> EthercatResult<u3, ServoError> {
    if drive > 7
        {return Err(EthercatError::Master("SoE drive number must be below 8"))}
    Ok(u3::new(drive))
}


/// error reported by a slave during a SoE exchange
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ServoError {
    Mailbox(MailboxError),
    /// error code reported by the drive about the accessed IDN
    Idn(u16),
}
impl From<MailboxError> for ServoError {
    fn from(src: MailboxError) -> Self {ServoError::Mailbox(src)}
}
impl fmt::Display for ServoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mailbox(error) => write!(f, "mailbox error {}", error),
            Self::Idn(code) => write!(f, "SoE error {:#x}", code),
        }
    }
}


/// ETG.1000.6 5.8.2
#[bitsize(32)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub struct SoeHeader {
    pub opcode: SoeOpcode,
    /// more fragments follow this one
    pub incomplete: bool,
    /// the frame reports an error, its code is in the last 2 bytes
    pub error: bool,
    /// drive number in the slave
    pub drive: u3,
    /// elements of the IDN transfered, see [elements]
    pub elements: u8,
    /// IDN, or number of fragments left in an incomplete frame
    pub idn: u16,
}
data::bilge_pdudata!(SoeHeader, u32);

#[bitsize(3)]
#[derive(FromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum SoeOpcode {
    #[fallback]
    Unknown = 0,
    ReadRequest = 1,
    ReadResponse = 2,
    WriteRequest = 3,
    WriteResponse = 4,
    Notification = 5,
    Emergency = 6,
}
