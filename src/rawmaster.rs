/*!
	low level ethercat communication functions.

	It wraps an ethercat socket to send ethercat frames containing commands and receive their answers.
*/

use core::time::Duration;
use tokio::{
    sync::Mutex,
    time::{Instant, timeout_at},
    };
use futures::future::poll_fn;
use bilge::prelude::*;
use log::{trace, debug};

use crate::{
    socket::*,
    data::{self, Field, PduData, Storage, Cursor},
    error::{EthercatError, EthercatResult},
    };


/// maximum ethercat frame size (ethercat header and datagrams) fitting in a standard ethernet frame
pub const MAX_ETHERCAT_FRAME: usize = 1500;
/// maximum data size in one datagram sent alone in a frame
pub const MAX_DATAGRAM: usize = MAX_ETHERCAT_FRAME - 2 - PDU_HEADER - PDU_FOOTER;

/// bytes of a datagram header
const PDU_HEADER: usize = 10;
/// bytes of a datagram footer (the working counter)
const PDU_FOOTER: usize = 2;

/**
    low level ethercat communication functions, with no notion of slave.

    genericity allows to use any medium implementing [EthercatSocket], see [crate::socket] for more details.

    This struct does not do any checking of the communication states on the slaves, and has no notion of slave, it is just executing the basic commands.

    The ethercat low level is all about PDUs (aka datagrams): an ethercat frame contains any number of PDU, each PDU is a command, acting on one of the 2 memories types:

    - **Physical Memory** (aka. registers)

      each slave has its own physical memory, commands for physical memory (`*P*`, `B*`) are addressing a specific slave, or combining the memory reads from all slaves

      The physical memory is divided into registers declared in [crate::registers]

    - **Logical Memory** (aka. fieldbus memory)

      this memory doesn't physically exist anywhere, but can be read/write using `L*`  commands with each slave contributing to the record according to the FMMU configuration set before.

    Only one PDU is in flight at a time: a PDU is sent alone in its frame, and the master waits for the matching answer or the timeout before any other PDU can be sent. Answers are matched using the PDU index (a token incremented for each PDU) and command, frames not matching are discarded.
*/
pub struct RawMaster {
    // socket implementation
    socket: Box<dyn EthercatSocket + Send + Sync>,
    /// default timeout for typed commands
    timeout: Duration,
    /// largest frame accepted by both this master and the socket
    max_frame: usize,
    // communication state, locked for the whole duration of an exchange
    state: Mutex<PduState>,
}
struct PduState {
    token: u8,
    send: [u8; MAX_ETHERCAT_FRAME],
    receive: [u8; MAX_ETHERCAT_FRAME],
}

impl RawMaster {
    pub fn new<S: EthercatSocket + 'static + Send + Sync>(socket: S, timeout: Duration) -> Self {
        let max_frame = socket.max_frame().min(MAX_ETHERCAT_FRAME);
        Self {
            socket: Box::new(socket),
            timeout,
            max_frame,
            state: Mutex::new(PduState {
                token: 0,
                send: [0; MAX_ETHERCAT_FRAME],
                receive: [0; MAX_ETHERCAT_FRAME],
                }),
        }
    }
    /// default timeout used by typed commands
    pub fn timeout(&self) -> Duration  {self.timeout}
    /// maximum data size a single PDU can carry on this socket
    pub fn max_pdu(&self) -> usize  {self.max_frame - 2 - PDU_HEADER - PDU_FOOTER}

	// shorthands to PDU commands
	pub async fn brd<T: PduData>(&self, address: Field<T>) -> EthercatResult<PduAnswer<T>> {
        self.read(SlaveAddress::Broadcast, address).await
	}
	pub async fn bwr<T: PduData>(&self, address: Field<T>, data: T) -> EthercatResult<PduAnswer<()>> {
        self.write(SlaveAddress::Broadcast, address, data).await
	}
	pub async fn brw<T: PduData>(&self, address: Field<T>, data: T) -> EthercatResult<PduAnswer<T>> {
        self.exchange(SlaveAddress::Broadcast, address, data).await
	}

	pub async fn aprd<T: PduData>(&self, slave: u16, address: Field<T>) -> EthercatResult<PduAnswer<T>> {
        self.read(SlaveAddress::AutoIncremented(slave), address).await
	}
	pub async fn apwr<T: PduData>(&self, slave: u16, address: Field<T>, data: T) -> EthercatResult<PduAnswer<()>> {
        self.write(SlaveAddress::AutoIncremented(slave), address, data).await
	}
	pub async fn aprw<T: PduData>(&self, slave: u16, address: Field<T>, data: T) -> EthercatResult<PduAnswer<T>> {
        self.exchange(SlaveAddress::AutoIncremented(slave), address, data).await
	}
	pub async fn armw<T: PduData>(&self, slave: u16, address: Field<T>) -> EthercatResult<PduAnswer<T>> {
        self.read_multiple(SlaveAddress::AutoIncremented(slave), address).await
	}

	pub async fn fprd<T: PduData>(&self, slave: u16, address: Field<T>) -> EthercatResult<PduAnswer<T>> {
        self.read(SlaveAddress::Fixed(slave), address).await
	}
	pub async fn fpwr<T: PduData>(&self, slave: u16, address: Field<T>, data: T) -> EthercatResult<PduAnswer<()>> {
        self.write(SlaveAddress::Fixed(slave), address, data).await
	}
	pub async fn fprw<T: PduData>(&self, slave: u16, address: Field<T>, data: T) -> EthercatResult<PduAnswer<T>> {
        self.exchange(SlaveAddress::Fixed(slave), address, data).await
	}
	pub async fn frmw<T: PduData>(&self, slave: u16, address: Field<T>) -> EthercatResult<PduAnswer<T>> {
        self.read_multiple(SlaveAddress::Fixed(slave), address).await
	}

	pub async fn lrd<T: PduData>(&self, address: Field<T>) -> EthercatResult<PduAnswer<T>> {
        self.read(SlaveAddress::Logical(0), address).await
	}
	pub async fn lwr<T: PduData>(&self, address: Field<T>, data: T) -> EthercatResult<PduAnswer<()>> {
        self.write(SlaveAddress::Logical(0), address, data).await
	}
	pub async fn lrw<T: PduData>(&self, address: Field<T>, data: T) -> EthercatResult<PduAnswer<T>> {
        self.exchange(SlaveAddress::Logical(0), address, data).await
	}

	/// maps to a *rd command
	pub async fn read<T: PduData>(&self, slave: SlaveAddress, memory: Field<T>) -> EthercatResult<PduAnswer<T>> {
        let command = match slave {
            SlaveAddress::Broadcast => PduCommand::BRD,
            SlaveAddress::AutoIncremented(_) => PduCommand::APRD,
            SlaveAddress::Fixed(_) => PduCommand::FPRD,
            SlaveAddress::Logical(_) => PduCommand::LRD,
            };
        let mut buffer = T::Packed::zeroed();
        let answers = self.typed(command, slave, memory, buffer.as_mut()).await?;
        Ok(PduAnswer {answers, value: T::unpack(buffer.as_ref())?})
    }
	/// maps to a *wr command
	pub async fn write<T: PduData>(&self, slave: SlaveAddress, memory: Field<T>, data: T) -> EthercatResult<PduAnswer<()>> {
        let command = match slave {
            SlaveAddress::Broadcast => PduCommand::BWR,
            SlaveAddress::AutoIncremented(_) => PduCommand::APWR,
            SlaveAddress::Fixed(_) => PduCommand::FPWR,
            SlaveAddress::Logical(_) => PduCommand::LWR,
            };
        let mut buffer = T::Packed::zeroed();
        data.pack(buffer.as_mut())?;
        let answers = self.typed(command, slave, memory, buffer.as_mut()).await?;
		Ok(PduAnswer {answers, value: ()})
	}
	/// maps to a *rw command
	pub async fn exchange<T: PduData>(&self, slave: SlaveAddress, memory: Field<T>, data: T) -> EthercatResult<PduAnswer<T>> {
        let command = match slave {
            SlaveAddress::Broadcast => PduCommand::BRW,
            SlaveAddress::AutoIncremented(_) => PduCommand::APRW,
            SlaveAddress::Fixed(_) => PduCommand::FPRW,
            SlaveAddress::Logical(_) => PduCommand::LRW,
            };
        let mut buffer = T::Packed::zeroed();
        data.pack(buffer.as_mut())?;
        let answers = self.typed(command, slave, memory, buffer.as_mut()).await?;
        Ok(PduAnswer {answers, value: T::unpack(buffer.as_ref())?})
	}
	/// maps to a *rmw command: the addressed slave is read, and the value is written to all the following slaves
	pub async fn read_multiple<T: PduData>(&self, slave: SlaveAddress, memory: Field<T>) -> EthercatResult<PduAnswer<T>> {
        let command = match slave {
            SlaveAddress::AutoIncremented(_) => PduCommand::ARMW,
            SlaveAddress::Fixed(_) => PduCommand::FRMW,
            _ => return Err(EthercatError::Master("read multiple write needs a physical slave address")),
            };
        let mut buffer = T::Packed::zeroed();
        let answers = self.typed(command, slave, memory, buffer.as_mut()).await?;
        Ok(PduAnswer {answers, value: T::unpack(buffer.as_ref())?})
	}

    async fn typed<T: PduData>(&self, command: PduCommand, slave: SlaveAddress, memory: Field<T>, buffer: &mut [u8]) -> EthercatResult<u16> {
        let size = buffer.len();
        let data = buffer.get_mut(.. memory.len)
            .ok_or(data::PackingError::BadSize(size, "field is bigger than its data type"))?;
        let (slave_address, memory_address) = slave.split(memory.byte)?;
        self.pdu(command, slave_address, memory_address, data, self.timeout).await
    }

	/**
        send a PDU on the ethercat bus and wait for its answer

        the answer data is written back into `data`, whose length is the PDU data length.
        returns the number of slaves who processed the command (the working counter).
        if no answer comes before `timeout`, the working counter is 0 and `data` is left untouched
    */
	pub async fn pdu(&self, command: PduCommand, slave_address: u16, memory_address: u16, data: &mut [u8], timeout: Duration) -> EthercatResult<u16> {
        if data.len() > self.max_pdu()
            {return Err(EthercatError::Master("data too big for one PDU"))}
        let deadline = Instant::now() + timeout;

        let mut state = self.state.lock().await;
        let PduState {token, send, receive} = &mut *state;
        let index = *token;
        *token = token.wrapping_add(1);

        // build the frame
        let size = {
            let mut cursor = Cursor::new(&mut send[..]);
            cursor.pack(&EthercatHeader::new(
                u11::new((PDU_HEADER + data.len() + PDU_FOOTER) as u16),
                EthercatType::PDU,
                ))?;
            cursor.pack(&PduHeader {
                command,
                token: index,
                slave_address,
                memory_address,
                flags: PduFlags::new(u11::new(data.len() as u16), false, false),
                interrupt: 0,
                })?;
            cursor.write(data)?;
            cursor.pack(&0u16)?;
            cursor.position()
        };
        trace!("pdu {:?} token {} slave {:#x} memory {:#x} len {}",
            command, index, slave_address, memory_address, data.len());

        let frame = &send[.. size];
        match timeout_at(deadline, poll_fn(|cx| self.socket.poll_send(cx, frame))).await {
            Ok(sent) => sent?,
            Err(_) => {
                debug!("pdu {:?} token {}: send timeout", command, index);
                return Ok(0);
            },
        }

        // wait the answer, frames that do not match are dropped
        loop {
            let received = match timeout_at(deadline, poll_fn(|cx| self.socket.poll_receive(cx, &mut receive[..]))).await {
                Ok(received) => received?,
                Err(_) => {
                    debug!("pdu {:?} token {}: no answer before timeout", command, index);
                    return Ok(0);
                },
            };
            match extract(&receive[.. received], command, index, data) {
                Ok(Some(answers)) => {
                    trace!("pdu {:?} token {} answered by {}", command, index, answers);
                    return Ok(answers);
                },
                Ok(None) => debug!("pdu {:?} token {}: discarding unrelated frame", command, index),
                Err(error) => debug!("pdu {:?} token {}: discarding malformed frame: {}", command, index, error),
            }
        }
	}
}

/// search a received frame for the answer to the given PDU, copying its data to `data` if found
fn extract(frame: &[u8], command: PduCommand, token: u8, data: &mut [u8]) -> data::PackingResult<Option<u16>> {
    let mut frame = Cursor::new(frame);
    let header = frame.unpack::<EthercatHeader>()?;
    if ! matches!(header.ty(), EthercatType::PDU)
        {return Ok(None)}
    let payload = frame.read(usize::from(header.len().value()))?;
    let mut frame = Cursor::new(payload);
    loop {
        let header = frame.unpack::<PduHeader>()?;
        let start = frame.position();
        let size = usize::from(header.flags.len().value());
        frame.read(size)?;
        let answers = frame.unpack::<u16>()?;
        let content = &payload[start .. start + size];
        if header.command == command && header.token == token && content.len() == data.len() {
            data.copy_from_slice(content);
            return Ok(Some(answers));
        }
        if ! header.flags.next()
            {return Ok(None)}
    }
}


/// dynamically specifies a destination address on the ethercat loop
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SlaveAddress {
	/// every slave will receive and execute
	Broadcast,
	/// address will be determined by the topology (index of the slave in the ethernet loop, starting from 0)
	AutoIncremented(u16),
	/// address has been set by the master previously
	Fixed(u16),
	/// the logical memory is the destination, all slaves are concerned. The value is an offset added to the field address
	Logical(u32),
}
impl SlaveAddress {
    /// slave and memory addresses in the PDU header for a field in the addressed memory
    pub fn split(self, byte: usize) -> EthercatResult<(u16, u16)> {
        let memory = u16::try_from(byte)
            .map_err(|_| EthercatError::Master("physical memory address out of range"));
        Ok(match self {
            SlaveAddress::Broadcast => (0, memory?),
            SlaveAddress::AutoIncremented(position) => (0u16.wrapping_sub(position), memory?),
            SlaveAddress::Fixed(station) => (station, memory?),
            SlaveAddress::Logical(base) => {
                let address = u32::try_from(byte).ok()
                    .and_then(|byte| base.checked_add(byte))
                    .ok_or(EthercatError::Master("logical address out of range"))?;
                (address as u16, (address >> 16) as u16)
            },
        })
    }
}

/// answer of a PDU, with the number of slaves who processed it
#[derive(Clone, Debug)]
pub struct PduAnswer<T> {
	pub answers: u16,
	pub value: T,
}
impl<T> PduAnswer<T> {
    /// the value, if exactly one slave answered
    pub fn one(self) -> EthercatResult<T> {
        self.exact(1)
    }
    /// the value, if exactly `n` slaves answered
    pub fn exact(self, n: u16) -> EthercatResult<T> {
        if self.answers == n  {Ok(self.value)}
        else if self.answers == 0  {Err(EthercatError::Timeout("no slave answered"))}
        else  {Err(EthercatError::Protocol("unexpected working counter"))}
    }
}


/// ethercat frame header (common to ethernet or UDP mediums) as described in ETG 1000.4 table 11
#[bitsize(16)]
#[derive(TryFromBits, DebugBits, Copy, Clone)]
struct EthercatHeader {
    /// length of the ethercat frame (minus 2 bytes, which is the header)
    len: u11,
    reserved: u1,
    /// frame type
    ty: EthercatType,
}
data::bilge_pdudata!(EthercatHeader, u16);

/// type of ethercat frame
#[bitsize(4)]
#[derive(TryFromBits, Debug, Copy, Clone)]
enum EthercatType {
    /// process data unit, use to exchange with physical and logical memory
    ///
    /// See ETG.1000.4
    PDU = 0x1,

    NetworkVariable = 0x4,

    /// mailbox gateway communication, between the master and non-slave devices
    ///
    /// See ETG.8200
    Mailbox = 0x5,
}


/// header of a PDU
// not byte aligned, so packed by hand around its flags
#[derive(Copy, Clone, Debug)]
struct PduHeader {
    /// PDU command, specifying whether logical or physical memory is accesses, addressing type, and what read/write operation
    command: PduCommand,
    /// PDU task request identifier
    token: u8,
    /// slave address, its meaning depend on the command
    slave_address: u16,
    /// memory address of the data to access, which memory is accessed depend on the command
    memory_address: u16,
    flags: PduFlags,
    interrupt: u16,
}
impl PduData for PduHeader {
    const ID: data::TypeId = data::TypeId::CUSTOM;
    type Packed = [u8; PDU_HEADER];

    fn pack(&self, dst: &mut [u8]) -> data::PackingResult<()> {
        let mut cursor = Cursor::new(dst);
        cursor.pack(&u8::from(self.command))?;
        cursor.pack(&self.token)?;
        cursor.pack(&self.slave_address)?;
        cursor.pack(&self.memory_address)?;
        cursor.pack(&self.flags)?;
        cursor.pack(&self.interrupt)
    }
    fn unpack(src: &[u8]) -> data::PackingResult<Self> {
        let mut cursor = Cursor::new(src);
        Ok(Self {
            command: PduCommand::from(cursor.unpack::<u8>()?),
            token: cursor.unpack()?,
            slave_address: cursor.unpack()?,
            memory_address: cursor.unpack()?,
            flags: cursor.unpack()?,
            interrupt: cursor.unpack()?,
        })
    }
}

#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone)]
struct PduFlags {
    /// data length following the header, excluding the footer. starting from `memory_address` in the addressed memory
    len: u11,
    reserved: u3,
    circulating: bool,
    /// true if there is an other PDU in the same frame
    next: bool,
}
data::bilge_pdudata!(PduFlags, u16);

/// the possible PDU commands
#[bitsize(8)]
#[derive(FromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum PduCommand {
    /// no operation
    #[fallback]
    NOP = 0x0,

    /// broadcast read
    BRD = 0x07,
    /// broadcast write
    BWR = 0x08,
    /// broadcast read & write
    BRW = 0x09,

    /// auto-incremented slave read
    APRD = 0x01,
    /// auto-incremented slave write
    APWR = 0x02,
    /// auto-incremented slave read & write
    APRW = 0x03,

    /// fixed slave read
    FPRD = 0x04,
    /// fixed slave write
    FPWR = 0x05,
    /// fixed slave read & write
    FPRW = 0x06,

    /// logical memory read
    LRD = 0x0A,
    /// logical memory write
    LWR = 0x0B,
    /// logical memory read & write
    LRW = 0x0C,

    /// auto-incremented slave read multiple write
    ARMW = 0x0D,
    /// fixed slave read multiple write
    FRMW = 0x0E,
}
