/*!
    Slave Information Interface (SII): access to the slave's EEPROM through its registers.

    ETG.1000.4 6.4, ETG.1000.6 5.4
*/

use core::time::Duration;
use tokio::time::{Instant, sleep};
use log::debug;

use crate::{
    data::{PduData, Field, Storage},
    rawmaster::RawMaster,
    registers::{self, SiiControl},
    eeprom::{self, CategoryType, CategoryHeader, CategorySyncManager, MailboxTypes, WORD},
    error::{EthercatError, EthercatResult},
    };


/// maximum number of categories walked, in case the EEPROM content has no end marker
const MAX_CATEGORIES: usize = 64;
/// delay between two polls of the SII busy flag
const POLL: Duration = Duration::from_micros(100);


/**
    implementation of the Slave Information Interface (SII) to communicate with a slave's EEPROM memory

    The EEPROM is word addressed. Reads are done by 4 bytes, writes by 2 bytes. Every transaction waits for the interface to become idle, and is bounded by the given timeout.
*/
pub struct Sii<'a> {
    master: &'a RawMaster,
    slave: u16,
    timeout: Duration,
}
impl<'a> Sii<'a> {
    /// access the EEPROM of the slave with the given fixed address
    pub fn new(master: &'a RawMaster, slave: u16, timeout: Duration) -> Self {
        Self {master, slave, timeout}
    }

    /// wait for the interface to finish its current operation, and return its status
    async fn idle(&self) -> EthercatResult<SiiControl> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let control = self.master.fprd(self.slave, registers::sii::control).await?.one()?;
            if ! control.busy()
                {return Ok(control)}
            if Instant::now() > deadline
                {return Err(EthercatError::Timeout("eeprom busy"))}
            sleep(POLL).await;
        }
    }
    /// clear error flags left by a previous operation
    async fn clear(&self) -> EthercatResult {
        let control = self.idle().await?;
        if control.error() {
            debug!("slave {:#x}: clearing sii errors {:?}", self.slave, control);
            self.master.fpwr(self.slave, registers::sii::control, SiiControl::from(0u16)).await?.one()?;
        }
        Ok(())
    }

    /**
        read 4 bytes starting at the given word

        a command not received by the slave is retried once, a command not acknowledged by the EEPROM is retried until timeout
    */
    pub async fn read_word(&self, word: u16) -> EthercatResult<u32> {
        self.clear().await?;
        let deadline = Instant::now() + self.timeout;
        let mut missed = 0;
        loop {
            let sent = self.master.fpwr(self.slave, registers::sii::address, u32::from(word)).await?.answers;
            let sent = sent.min(self.master.fpwr(self.slave, registers::sii::control, SiiControl::read()).await?.answers);
            if sent == 0 {
                missed += 1;
                if missed > 1
                    {return Err(EthercatError::Timeout("eeprom read command not received"))}
                debug!("slave {:#x}: eeprom read command lost, retrying", self.slave);
                continue;
            }
            let control = self.idle().await?;
            if control.command_error() {
                if Instant::now() > deadline
                    {return Err(EthercatError::Timeout("eeprom not acknowledging"))}
                debug!("slave {:#x}: eeprom read not acknowledged, retrying", self.slave);
                self.clear().await?;
                sleep(POLL).await;
                continue;
            }
            return self.master.fprd(self.slave, registers::sii::data).await?.one();
        }
    }

    /// write 2 bytes at the given word
    pub async fn write_word(&self, word: u16, value: u16) -> EthercatResult {
        self.clear().await?;
        let deadline = Instant::now() + self.timeout;
        loop {
            self.master.fpwr(self.slave, registers::sii::data_write, value).await?.one()?;
            self.master.fpwr(self.slave, registers::sii::address, u32::from(word)).await?.one()?;
            self.master.fpwr(self.slave, registers::sii::control, SiiControl::write()).await?.one()?;
            let control = self.idle().await?;
            if control.write_error()
                {return Err(EthercatError::Protocol("eeprom write refused"))}
            if ! control.command_error()
                {return Ok(())}
            if Instant::now() > deadline
                {return Err(EthercatError::Timeout("eeprom not acknowledging"))}
            self.clear().await?;
            sleep(POLL).await;
        }
    }

    /// read `size` bytes starting at the given word
    pub async fn read_bytes(&self, word: u16, size: usize) -> EthercatResult<Vec<u8>> {
        let mut data = Vec::with_capacity(size + 4);
        let mut word = word;
        while data.len() < size {
            data.extend_from_slice(&self.read_word(word).await?.to_le_bytes());
            word = word.checked_add(2)
                .ok_or(EthercatError::Master("read beyond eeprom address space"))?;
        }
        data.truncate(size);
        Ok(data)
    }
    /// write bytes starting at the given word, the data size must be a whole number of words
    pub async fn write_bytes(&self, word: u16, data: &[u8]) -> EthercatResult {
        if data.len() % WORD != 0
            {return Err(EthercatError::Master("eeprom writes are made of whole words"))}
        for (i, chunk) in data.chunks_exact(WORD).enumerate() {
            let address = usize::from(word) + i;
            let address = u16::try_from(address)
                .map_err(|_| EthercatError::Master("write beyond eeprom address space"))?;
            self.write_word(address, u16::from_le_bytes([chunk[0], chunk[1]])).await?;
        }
        Ok(())
    }

    /// read a value from the EEPROM, the field is given in bytes
    pub async fn read<T: PduData>(&self, field: Field<T>) -> EthercatResult<T> {
        let word = u16::try_from(field.byte / WORD)
            .map_err(|_| EthercatError::Master("field beyond eeprom address space"))?;
        let data = self.read_bytes(word, field.len).await?;
        Ok(T::unpack(&data)?)
    }
    /// write a value to the EEPROM, the field is given in bytes
    pub async fn write<T: PduData>(&self, field: Field<T>, value: T) -> EthercatResult {
        let word = u16::try_from(field.byte / WORD)
            .map_err(|_| EthercatError::Master("field beyond eeprom address space"))?;
        let mut buffer = T::Packed::zeroed();
        value.pack(buffer.as_mut())?;
        self.write_bytes(word, &buffer.as_ref()[.. field.len]).await
    }

    /// read the standard content of the EEPROM and its categories
    pub async fn info(&self) -> EthercatResult<SiiInfo> {
        let mut info = SiiInfo {
            alias: self.read(eeprom::address_alias).await?,
            vendor: self.read(eeprom::device::vendor).await?,
            product: self.read(eeprom::device::product).await?,
            revision: self.read(eeprom::device::revision).await?,
            serial: self.read(eeprom::device::serial_number).await?,
            mailbox_write: (
                self.read(eeprom::mailbox::standard::receive::offset).await?,
                self.read(eeprom::mailbox::standard::receive::size).await?,
                ),
            mailbox_read: (
                self.read(eeprom::mailbox::standard::send::offset).await?,
                self.read(eeprom::mailbox::standard::send::size).await?,
                ),
            protocols: self.read(eeprom::mailbox::protocols).await?,
            name: None,
            sync_managers: Vec::new(),
            output_bits: 0,
            input_bits: 0,
            };

        let mut strings = Vec::new();
        let mut name = 0;
        let mut word = (eeprom::categories / WORD) as u16;
        for _ in 0 .. MAX_CATEGORIES {
            let header = CategoryHeader::unpack(&self.read_word(word).await?.to_le_bytes())?;
            if header.category() == CategoryType::End
                {break}
            let start = word + 2;
            let size = usize::from(header.size()) * WORD;
            let interesting = matches!(header.category(),
                CategoryType::Strings
                | CategoryType::General
                | CategoryType::SyncManager
                | CategoryType::TxPdo
                | CategoryType::RxPdo);
            if interesting {
                let data = self.read_bytes(start, size).await?;
                match header.category() {
                    CategoryType::Strings => strings = eeprom::parse_strings(&data)?,
                    CategoryType::General => name = eeprom::general_name(&data)?,
                    CategoryType::SyncManager => info.sync_managers = eeprom::parse_sync_managers(&data)?,
                    CategoryType::TxPdo => info.input_bits += eeprom::pdo_bits(&eeprom::parse_pdos(&data)?),
                    CategoryType::RxPdo => info.output_bits += eeprom::pdo_bits(&eeprom::parse_pdos(&data)?),
                    _ => {},
                }
            }
            word = match start.checked_add(header.size()) {
                Some(next) => next,
                None => break,
            };
        }
        info.name = eeprom::string(&strings, name).map(String::from);
        Ok(info)
    }
}

/// standard content of a slave's EEPROM used for configuring it
#[derive(Clone, Debug)]
pub struct SiiInfo {
    pub alias: u16,
    pub vendor: u32,
    pub product: u32,
    pub revision: u32,
    pub serial: u32,
    /// offset and size of the mailbox from master to slave
    pub mailbox_write: (u16, u16),
    /// offset and size of the mailbox from slave to master
    pub mailbox_read: (u16, u16),
    pub protocols: MailboxTypes,
    /// device name from the general category, if any
    pub name: Option<String>,
    pub sync_managers: Vec<CategorySyncManager>,
    /// sum of the RxPDO entries sizes over all RxPDO categories
    pub output_bits: u32,
    /// sum of the TxPDO entries sizes over all TxPDO categories
    pub input_bits: u32,
}

/// name given to slaves with no name in EEPROM
pub fn default_name(vendor: u32, product: u32) -> String {
    format!("? M:{:08x} I:{:08x}", vendor, product)
}
