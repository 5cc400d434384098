/*!
    Master core for ethercat segments.

    Layers from the lowest to the highest:

    - [socket] the medium frames are sent on, implemented outside of this crate
    - [rawmaster] datagrams and their working counters
    - [registers], [eeprom], [sii] the memory of the slaves
    - [slave], [mailbox], [can], [servo], [mapping], [clock] the protocols run with one slave
    - [master] the context of a whole segment, which most users only need
*/
#![allow(non_upper_case_globals)]

pub mod socket;
pub mod data;
pub mod error;
pub mod rawmaster;
pub mod registers;
pub mod eeprom;
pub mod sii;
pub mod config;
pub mod mailbox;
pub mod can;
pub mod servo;
pub mod sdo;
pub mod mapping;
pub mod clock;
pub mod slave;
pub mod diagnostics;
pub mod master;

pub use crate::data::{PduData, Field};
pub use crate::error::{EthercatError, EthercatResult};
pub use crate::socket::*;
pub use crate::rawmaster::{RawMaster, PduAnswer, PduCommand, SlaveAddress};
pub use crate::registers::{AlState, AlError};
pub use crate::config::{MasterConfig, PollBackoff};
pub use crate::sdo::Sdo;
pub use crate::slave::{Slave, SlaveInfo, CommunicationState};
pub use crate::diagnostics::{Record, Event};
pub use crate::master::{Master, Stage};
