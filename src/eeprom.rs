/*!
    This module expose the standard EEPROM registers and categories. registers are defined as [Field]s in the EEPROM (byte addressed), which content can be accessed using the instance of [crate::sii::Sii] (Slave Information Interface) proper to each slave.

    ETG.1000.6 5.4
*/

use crate::data::{self, PduData, Field, Cursor, PackingResult};
use bilge::prelude::*;


pub const WORD: usize = core::mem::size_of::<u16>();


//  ETG.1000.6 5.4 table 16

/// Alias Address
pub const address_alias: Field<u16> = Field::simple(WORD*0x0004);

pub mod device {
    use super::*;

    pub const vendor: Field<u32> = Field::simple(WORD*0x0008);
    pub const product: Field<u32> = Field::simple(WORD*0x000a);
    pub const revision: Field<u32> = Field::simple(WORD*0x000c);
    pub const serial_number: Field<u32> = Field::simple(WORD*0x000e);
}

pub mod mailbox {
    use super::*;

    /// mailbox recommended parameters during states other than bootstrap
    pub mod standard {
        use super::*;
        pub mod receive {
            use super::*;

            /// Receive Mailbox Offset for Standard state (master to slave)
            pub const offset: Field<u16> = Field::simple(WORD*0x0018);
            /// Receive Mailbox Size for Standard state (master to slave)
            pub const size: Field<u16> = Field::simple(WORD*0x0019);
        }
        pub mod send {
            use super::*;

            /// Send Mailbox Offset for Standard state (slave to master)
            pub const offset: Field<u16> = Field::simple(WORD*0x001a);
            /// Send Mailbox Size for Standard state (slave to master)
            pub const size: Field<u16> = Field::simple(WORD*0x001b);
        }
    }
    /// Mailbox Protocols Supported as defined in ETG.1000.6 Table 18
    pub const protocols: Field<MailboxTypes> = Field::simple(WORD*0x001c);
}

/// first category header
pub const categories: usize = WORD*0x0040;


/// ETG.1000.6 table 18
#[bitsize(8)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq)]
pub struct MailboxTypes {
    /// ADS over EtherCAT (routing and parallel services)
    pub ads: bool,
    /// Ethernet over EtherCAT (tunnelling of Data Link services)
    pub ethernet: bool,
    /// CAN application protocol over EtherCAT (access to SDO)
    pub can: bool,
    /// File Access over EtherCAT
    pub file: bool,
    /// Servo Drive Profile over EtherCAT
    pub servo: bool,
    /// Vendor specific protocol over EtherCAT
    pub specific: bool,
    reserved: u2,
}
data::bilge_pdudata!(MailboxTypes, u8);

impl Default for MailboxTypes {
    fn default() -> Self {Self::from(0u8)}
}


/// header for a SII category
#[bitsize(32)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub struct CategoryHeader {
    /// Category Type as defined in ETG.1000.6 Table 19
    pub category: CategoryType,
    /// Following Category Word Size
    pub size: u16,
}
data::bilge_pdudata!(CategoryHeader, u32);

/// type of category in the SII
#[bitsize(16)]
#[derive(FromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum CategoryType {
    Nop = 0,
    /// category type this master does not use
    #[fallback]
    Unused = 1,
    /// String repository for other Categories structure of this category data see ETG.1000.6 Table 20
    Strings = 10,
    /// Data Types for future use
    DataTypes = 20,
    /// General information structure of this category data see ETG.1000.6 Table 21
    General = 30,
    /// FMMUs to be used structure of this category data see ETG.1000.6 Table 23
    Fmmu = 40,
    /// Sync Manager Configuration structure of this category data see ETG.1000.6 Table 24
    SyncManager = 41,
    /// TxPDO description structure of this category data see ETG.1000.6 Table 25
    TxPdo = 50,
    /// RxPDO description structure of this category data see ETG.1000.6 Table 25
    RxPdo = 51,
    /// Distributed Clock for future use
    Dc = 60,
    /// mark the end of SII categories
    End = 0xffff,
}

/**
    the strings category, all strings referenced by index in the other categories

    indices start from 1, index 0 means no string
*/
pub fn parse_strings(data: &[u8]) -> PackingResult<Vec<String>> {
    let mut cursor = Cursor::new(data);
    let count = cursor.unpack::<u8>()?;
    let mut strings = Vec::with_capacity(usize::from(count));
    for _ in 0 .. count {
        let len = cursor.unpack::<u8>()?;
        let text = cursor.read(usize::from(len))?;
        strings.push(String::from_utf8_lossy(text).into_owned());
    }
    Ok(strings)
}

/// find the string at the given index (starting from 1) of a strings category
pub fn string(strings: &[String], index: u8) -> Option<&str> {
    usize::from(index).checked_sub(1)
        .and_then(|index| strings.get(index))
        .map(|text| text.as_str())
}

/// index of the device name in the strings category, read from the general category
pub fn general_name(data: &[u8]) -> PackingResult<u8> {
    // group, image, order, then name
    Field::<u8>::simple(3).get(data)
}

/// ETG.1000.6 table 24
#[bitsize(64)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq)]
pub struct CategorySyncManager {
    /// Origin of Data (see Physical Start Address of SyncM)
    pub address: u16,
    pub length: u16,
    /// Defines Mode of Operation (see Control Register of SyncM)
    pub control: u8,
    /// don't care
    pub status: u8,
    pub enable: u8,
    pub usage: SyncManagerUsage,
}
data::bilge_pdudata!(CategorySyncManager, u64);

#[bitsize(8)]
#[derive(FromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum SyncManagerUsage {
    #[fallback]
    Disabled = 0x0,
    MailboxOut = 0x1,
    MailboxIn = 0x2,
    ProcessOut = 0x3,
    ProcessIn = 0x4,
}

/// the sync managers category, one entry per sync manager channel
pub fn parse_sync_managers(data: &[u8]) -> PackingResult<Vec<CategorySyncManager>> {
    data.chunks_exact(CategorySyncManager::packed_size())
        .map(CategorySyncManager::unpack)
        .collect()
}

/// ETG.1000.6 table 25
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CategoryPdo {
    pub index: u16,
    pub entries: u8,
    /// sync manager channel this PDO is assigned to
    pub sync_manager: u8,
    pub dc_sync: u8,
    /// index to the strings category
    pub name: u8,
    pub flags: u16,
}

/// ETG.1000.6 table 26
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CategoryPdoEntry {
    pub index: u16,
    pub sub: u8,
    pub name: u8,
    pub data_type: u8,
    pub bitlen: u8,
    pub flags: u16,
}

/// the PDO categories (RxPdo or TxPdo)
pub fn parse_pdos(data: &[u8]) -> PackingResult<Vec<(CategoryPdo, Vec<CategoryPdoEntry>)>> {
    let mut cursor = Cursor::new(data);
    let mut pdos = Vec::new();
    // 8 bytes of header per PDO
    while cursor.remain().len() >= 8 {
        let pdo = CategoryPdo {
            index: cursor.unpack()?,
            entries: cursor.unpack()?,
            sync_manager: cursor.unpack()?,
            dc_sync: cursor.unpack()?,
            name: cursor.unpack()?,
            flags: cursor.unpack()?,
            };
        let mut entries = Vec::with_capacity(usize::from(pdo.entries));
        for _ in 0 .. pdo.entries {
            entries.push(CategoryPdoEntry {
                index: cursor.unpack()?,
                sub: cursor.unpack()?,
                name: cursor.unpack()?,
                data_type: cursor.unpack()?,
                bitlen: cursor.unpack()?,
                flags: cursor.unpack()?,
                });
        }
        pdos.push((pdo, entries));
    }
    Ok(pdos)
}

/// total bit size of PDOs assigned to a sync manager, PDOs not assigned are not exchanged
pub fn pdo_bits(pdos: &[(CategoryPdo, Vec<CategoryPdoEntry>)]) -> u32 {
    pdos.iter()
        .filter(|(pdo, _)| pdo.sync_manager < crate::registers::sync_manager::interface.num)
        .flat_map(|(_, entries)| entries.iter())
        .map(|entry| u32::from(entry.bitlen))
        .sum()
}
