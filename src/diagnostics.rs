//! bounded log of the events worth reporting about the segment: failed state changes, working counter shortfalls, mailbox failures

use core::{fmt, time::Duration};
use tokio::time::Instant;

use crate::{
    registers::{AlState, AlError},
    mailbox::MailboxError,
    can::{SdoAbortCode, Emergency},
    };


/// maximum number of records kept, the oldest are dropped first
pub const CAPACITY: usize = 64;

/// one event recorded
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    /// time since the master was opened
    pub time: Duration,
    /// station address of the slave concerned, if any
    pub slave: Option<u16>,
    pub event: Event,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// a slave reported an AL status code while in the given state
    AlStatus {state: AlState, code: AlError},
    /// less slaves than expected processed the process data of a group
    WorkingCounter {group: u8, expected: u16, received: u16},
    /// a mailbox answer never came about the given object
    MailboxTimeout {index: u16, sub: u8},
    /// a SDO transfer was aborted
    SdoAbort {index: u16, sub: u8, code: SdoAbortCode},
    /// a drive reported an error about an IDN
    SoeError {idn: u16, code: u16},
    Emergency(Emergency),
    /// a slave reported a mailbox error
    Mailbox(MailboxError),
    /// an unexpected or malformed answer about the given object
    Packet {index: u16, sub: u8, message: &'static str},
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlStatus {state, code} => write!(f, "AL status {} in state {:?}", code, state),
            Self::WorkingCounter {group, expected, received} => write!(f,
                "group {} working counter {} instead of {}", group, received, expected),
            Self::MailboxTimeout {index, sub} => write!(f, "mailbox timeout on {:#06x}:{}", index, sub),
            Self::SdoAbort {index, sub, code} => write!(f, "SDO {:#06x}:{} aborted {}", index, sub, code),
            Self::SoeError {idn, code} => write!(f, "SoE idn {:#06x} error {:#06x}", idn, code),
            Self::Emergency(emergency) => write!(f,
                "emergency {:#06x} register {:#04x} data {:02x?}",
                emergency.code, emergency.register, emergency.data),
            Self::Mailbox(error) => write!(f, "mailbox error {}", error),
            Self::Packet {index, sub, message} => write!(f, "packet error on {:#06x}:{}: {}", index, sub, message),
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>10.6}s ", self.time.as_secs_f64())?;
        match self.slave {
            Some(slave) => write!(f, "slave {:#06x} ", slave)?,
            None => write!(f, "segment ")?,
        }
        write!(f, "{}", self.event)
    }
}

/// ring of the last [CAPACITY] records
pub struct Diagnostics {
    start: Instant,
    records: heapless::Deque<Record, CAPACITY>,
}
impl Diagnostics {
    pub fn new() -> Self {
        Self {start: Instant::now(), records: heapless::Deque::new()}
    }
    /// record an event, dropping the oldest record if full
    pub fn push(&mut self, slave: Option<u16>, event: Event) {
        if self.records.is_full() {
            self.records.pop_front();
        }
        let record = Record {time: self.start.elapsed(), slave, event};
        // cannot fail since a place was just freed
        let _ = self.records.push_back(record);
    }
    /// records from the oldest to the newest
    pub fn records(&self) -> Vec<Record> {
        self.records.iter().cloned().collect()
    }
    pub fn len(&self) -> usize {self.records.len()}
    pub fn is_empty(&self) -> bool {self.records.is_empty()}
    pub fn clear(&mut self) {self.records.clear()}
    /// render all records, one per line
    pub fn report(&self) -> String {
        self.records.iter()
            .map(|record| format!("{}\n", record))
            .collect()
    }
}
impl Default for Diagnostics {
    fn default() -> Self {Self::new()}
}
