//! implementation of CoE (Canopen Over Ethercat)

use core::{fmt, time::Duration};
use bilge::prelude::*;
use log::{debug, warn};

use crate::{
	mailbox::{Mailbox, MailboxType, MailboxError},
	rawmaster::SlaveAddress,
	data::{self, PduData, Cursor},
	error::{EthercatError, EthercatResult},
	};


/// maximum byte size of sdo data that can be expedited
const EXPEDITED_MAX_SIZE: usize = 4;
/// bytes before the data in a normal transfer request or response: coe header, sdo header, total size
const SDO_NORMAL_OVERHEAD: usize = 2 + 4 + 4;
/// bytes before the data in a segment: coe header, segment header
const SDO_SEGMENT_OVERHEAD: usize = 2 + 1;
/// minimum data size of a segment, smaller segments are padded
const SDO_SEGMENT_MIN: usize = 7;

/**
    implementation of CoE (Canopen Over Ethercat)

    It works exactly as in a Can bus, except each of its frame is encapsulated in an ethercat mailbox frame.

    Canopen protocol exposes a dictionnary of simple values or single level structures, for non-realtime access. These are named SDO (Service Data Object), see [crate::sdo] for more details.

    Every transfer step (request sent, answer received) is bounded by the timeout given to the operation. An error in the middle of a transfer aborts it: the slave is sent an SDO abort and no partial data is returned.
*/
pub struct Can<'a> {
    mailbox: &'a mut Mailbox,
    /// emergency messages received from the slave while waiting for answers
    pub emergencies: Vec<Emergency>,
}
impl<'a> Can<'a> {
    pub fn new(mailbox: &'a mut Mailbox) -> Self {
        Self {mailbox, emergencies: Vec::new()}
    }

    fn address(&self) -> SlaveAddress {SlaveAddress::Fixed(self.mailbox.slave())}

    /**
        read an SDO, any size

        if `complete` is set, the whole object is read at once (complete access), in this case `sub` must be 0 to include subindex 0 in the data, or 1 to exclude it
    */
	pub async fn sdo_read(&mut self, index: u16, sub: u8, complete: bool, timeout: Duration) -> EthercatResult<Vec<u8>, CanError> {
        // generic request
        let mut buffer = [0; SDO_NORMAL_OVERHEAD];
        let mut frame = Cursor::new(buffer.as_mut_slice());
        frame.pack(&CoeHeader::new(u9::new(0), CanService::SdoRequest))?;
        frame.pack(&SdoHeader::new(
                false,
                false,
                u2::new(0),
                complete,
                u3::from(SdoCommandRequest::Upload),
                index,
                sub,
            ))?;
        frame.write(&[0; 4])?;
        self.mailbox.write(MailboxType::Can, frame.finish(), timeout).await?;

        // receive data
        let response = self.receive_response(index, sub, timeout).await?;
        let mut frame = Cursor::new(response.as_slice());
        frame.unpack::<CoeHeader>()?;
        let header = frame.unpack::<SdoHeader>()?;
        if header.command() != u3::from(SdoCommandResponse::Upload) {
            return self.abort(index, sub, SdoAbortCode::UnsupportedCommand, timeout,
                "slave answered with wrong operation").await;
        }

        if header.expedited() {
            // data is in the 4 bytes of size
            let size = if header.sized()
                {EXPEDITED_MAX_SIZE - usize::from(header.size().value())}
                else {EXPEDITED_MAX_SIZE};
            return Ok(frame.read(size)?.to_vec());
        }

        // normal transfer, eventually segmented
        let total = frame.unpack::<u32>()? as usize;
        let mut transfer = SegmentedTransfer::new(total, frame.remain());
        // receive more data from segments
        while ! transfer.complete() {
            // send segment request
            let mut buffer = [0; SDO_SEGMENT_OVERHEAD + SDO_SEGMENT_MIN];
            let mut frame = Cursor::new(buffer.as_mut_slice());
            frame.pack(&CoeHeader::new(u9::new(0), CanService::SdoRequest))?;
            frame.pack(&SdoSegmentHeader::new(
                    false,
                    u3::new(0),
                    transfer.toggle(),
                    u3::from(SdoCommandRequest::UploadSegment),
                ))?;
            frame.write(&[0; SDO_SEGMENT_MIN])?;
            self.mailbox.write(MailboxType::Can, frame.finish(), timeout).await?;

            // receive segment
            let response = match self.receive_coe(timeout).await {
                Ok(response) => response,
                Err(error) if error.is_timeout() => {
                    self.abort::<()>(index, sub, SdoAbortCode::Timeout, timeout, "").await.ok();
                    return Err(error);
                },
                Err(error) => return Err(error),
            };
            let mut frame = Cursor::new(response.as_slice());
            let coe = frame.unpack::<CoeHeader>()?;
            self.check_abort(coe, &response)?;
            let header = frame.unpack::<SdoSegmentHeader>()?;
            if coe.service() != CanService::SdoResponse || header.command() != u3::from(SdoCommandResponse::UploadSegment) {
                return self.abort(index, sub, SdoAbortCode::UnsupportedCommand, timeout,
                    "slave answered with wrong operation").await;
            }
            let data = segment_data(header, frame.remain());
            if let Err(code) = transfer.receive(header, data) {
                return self.abort(index, sub, code, timeout, code.description()).await;
            }
        }
        Ok(transfer.finish())
	}

	/**
        write an SDO, any size

        if `complete` is set, the whole object is written at once (complete access), in this case `sub` must be 0 to include subindex 0 in the data, or 1 to exclude it
    */
	pub async fn sdo_write(&mut self, index: u16, sub: u8, complete: bool, data: &[u8], timeout: Duration) -> EthercatResult<(), CanError> {
		if ! data.is_empty() && data.len() <= EXPEDITED_MAX_SIZE && ! complete {
			// expedited transfer
			// send data in the 4 bytes instead of data size
            let mut buffer = [0; SDO_NORMAL_OVERHEAD];
            let mut frame = Cursor::new(buffer.as_mut_slice());
            frame.pack(&CoeHeader::new(u9::new(0), CanService::SdoRequest))?;
            frame.pack(&SdoHeader::new(
                        true,
                        true,
                        u2::new((EXPEDITED_MAX_SIZE - data.len()) as u8),
                        complete,
                        u3::from(SdoCommandRequest::Download),
                        index,
                        sub,
                    ))?;
            frame.write(data)?;
            frame.write(&[0; 4][data.len() ..])?;
            self.mailbox.write(MailboxType::Can, frame.finish(), timeout).await?;

            // receive acknowledge
            self.receive_download(index, sub, timeout).await?;
            return Ok(());
		}

        // normal transfer, eventually segmented
        let total = u32::try_from(data.len())
            .map_err(|_| EthercatError::<CanError>::Master("sdo data too big"))?;
        let capacity = self.mailbox.capacity();
        if capacity <= SDO_NORMAL_OVERHEAD
            {return Err(EthercatError::Master("slave mailbox too small for sdo transfer"))}
        let mut data = Cursor::new(data);

        // send one download request with the start of data
        let mut buffer = vec![0; capacity];
        let mut frame = Cursor::new(buffer.as_mut_slice());
        frame.pack(&CoeHeader::new(u9::new(0), CanService::SdoRequest))?;
        frame.pack(&SdoHeader::new(
                    true,
                    false,
                    u2::new(0),
                    complete,
                    u3::from(SdoCommandRequest::Download),
                    index,
                    sub,
                ))?;
        frame.pack(&total)?;
        let segment = data.remain().len().min(capacity - SDO_NORMAL_OVERHEAD);
        frame.write(data.read(segment)?)?;
        self.mailbox.write(MailboxType::Can, frame.finish(), timeout).await?;

        // receive acknowledge
        self.receive_download(index, sub, timeout).await?;

        // send many segments for the rest of the data, aknowledge each time
        let mut toggle = false;
        while ! data.remain().is_empty() {
            // send segment
            let segment = data.remain().len().min(capacity - SDO_SEGMENT_OVERHEAD);
            let last = segment == data.remain().len();
            let content = data.read(segment)?;
            let padding = SDO_SEGMENT_MIN.saturating_sub(segment);
            let mut frame = Cursor::new(buffer.as_mut_slice());
            frame.pack(&CoeHeader::new(u9::new(0), CanService::SdoRequest))?;
            frame.pack(&SdoSegmentHeader::new(
                    last,
                    u3::new(padding as u8),
                    toggle,
                    u3::from(SdoCommandRequest::DownloadSegment),
                ))?;
            frame.write(content)?;
            frame.write(&[0; SDO_SEGMENT_MIN][.. padding])?;
            self.mailbox.write(MailboxType::Can, frame.finish(), timeout).await?;

            // receive aknowledge
            let response = self.receive_coe(timeout).await?;
            let mut frame = Cursor::new(response.as_slice());
            let coe = frame.unpack::<CoeHeader>()?;
            self.check_abort(coe, &response)?;
            let header = frame.unpack::<SdoSegmentHeader>()?;
            if coe.service() != CanService::SdoResponse || header.command() != u3::from(SdoCommandResponse::DownloadSegment) {
                return self.abort(index, sub, SdoAbortCode::UnsupportedCommand, timeout,
                    "slave answered with wrong operation").await;
            }
            if header.toggle() != toggle {
                return self.abort(index, sub, SdoAbortCode::BadToggle, timeout,
                    SdoAbortCode::BadToggle.description()).await;
            }
            toggle = ! toggle;
        }
        Ok(())
	}

	/// receive the acknowledge of a download request
	async fn receive_download(&mut self, index: u16, sub: u8, timeout: Duration) -> EthercatResult<(), CanError> {
        let response = self.receive_response(index, sub, timeout).await?;
        let mut frame = Cursor::new(response.as_slice());
        frame.unpack::<CoeHeader>()?;
        let header = frame.unpack::<SdoHeader>()?;
        if header.command() != u3::from(SdoCommandResponse::Download) {
            return self.abort(index, sub, SdoAbortCode::UnsupportedCommand, timeout,
                "slave answered with wrong operation").await;
        }
        Ok(())
	}

	/// receive a SDO response about the given object, and report aborts sent by the slave
	async fn receive_response(&mut self, index: u16, sub: u8, timeout: Duration) -> EthercatResult<Vec<u8>, CanError> {
        let response = self.receive_coe(timeout).await?;
        let mut frame = Cursor::new(response.as_slice());
        let coe = frame.unpack::<CoeHeader>()?;
        self.check_abort(coe, &response)?;
        if coe.service() != CanService::SdoResponse {
            return self.abort(index, sub, SdoAbortCode::UnsupportedCommand, timeout,
                "unexpected COE service during SDO operation").await;
        }
        let header = frame.unpack::<SdoHeader>()?;
        if header.index() != index || header.sub() != sub {
            return self.abort(index, sub, SdoAbortCode::GeneralError, timeout,
                "slave answered about wrong item").await;
        }
        Ok(response)
	}

	/// fail with the abort code if the given frame is an abort request
	fn check_abort(&self, coe: CoeHeader, frame: &[u8]) -> EthercatResult<(), CanError> {
        if coe.service() != CanService::SdoRequest
            {return Ok(())}
        let mut frame = Cursor::new(frame);
        frame.unpack::<CoeHeader>()?;
        let header = frame.unpack::<SdoHeader>()?;
        if header.command() != u3::from(SdoCommandRequest::Abort)
            {return Err(EthercatError::Protocol("slave sent a COE request"))}
        let code = SdoAbortCode::from(frame.unpack::<u32>()?);
        debug!("slave {:#x}: sdo {:#x}:{} aborted: {}", self.mailbox.slave(), header.index(), header.sub(), code);
        Err(EthercatError::Slave(self.address(), CanError::Sdo(code)))
	}

	/// receive the next CoE frame which is not an emergency, emergencies are stored
	async fn receive_coe(&mut self, timeout: Duration) -> EthercatResult<Vec<u8>, CanError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remain = deadline.saturating_duration_since(tokio::time::Instant::now());
            let (ty, content) = self.mailbox.read(remain).await?;
            if ty == MailboxType::Can {
                let coe = CoeHeader::unpack(&content)?;
                if coe.service() != CanService::Emergency
                    {return Ok(content)}
                let emergency = Emergency::unpack(&content[CoeHeader::packed_size() ..])?;
                warn!("slave {:#x}: emergency {:?}", self.mailbox.slave(), emergency);
                self.emergencies.push(emergency);
            }
            else {
                debug!("slave {:#x}: ignoring {:?} mailbox frame during sdo transfer", self.mailbox.slave(), ty);
            }
            if tokio::time::Instant::now() >= deadline
                {return Err(EthercatError::Timeout("no sdo answer"))}
        }
	}

	/// send an abort for the given object to the slave and fail with the given message
	async fn abort<T>(&mut self, index: u16, sub: u8, code: SdoAbortCode, timeout: Duration, message: &'static str) -> EthercatResult<T, CanError> {
        debug!("slave {:#x}: aborting sdo {:#x}:{}: {}", self.mailbox.slave(), index, sub, code);
        let mut buffer = [0; SDO_NORMAL_OVERHEAD];
        let mut frame = Cursor::new(buffer.as_mut_slice());
        frame.pack(&CoeHeader::new(u9::new(0), CanService::SdoRequest))?;
        frame.pack(&SdoHeader::new(
                false,
                false,
                u2::new(0),
                false,
                u3::from(SdoCommandRequest::Abort),
                index,
                sub,
            ))?;
        frame.pack(&u32::from(code))?;
        if let Err(error) = self.mailbox.write(MailboxType::Can, frame.finish(), timeout).await {
            debug!("slave {:#x}: cannot send sdo abort: {}", self.mailbox.slave(), error);
        }
        Err(EthercatError::Protocol(message))
	}
}

/// data carried by a segment, excluding the padding of short segments
fn segment_data(header: SdoSegmentHeader, data: &[u8]) -> &[u8] {
    let size = if data.len() == SDO_SEGMENT_MIN
        {SDO_SEGMENT_MIN - usize::from(header.size().value())}
        else {data.len()};
    &data[.. size.min(data.len())]
}

/**
    state of a segmented SDO upload: the toggle bit expected in the next segment, the data received so far and the total size announced by the slave

    Segments are accepted only with the expected toggle bit and as long as they do not overflow the announced size. The transfer is complete once the slave sent its last segment with all the announced data.
*/
#[derive(Clone, Debug)]
pub struct SegmentedTransfer {
    toggle: bool,
    received: Vec<u8>,
    total: usize,
    last: bool,
}
impl SegmentedTransfer {
    /// start a transfer with the data received in the initial response
    pub fn new(total: usize, first: &[u8]) -> Self {
        // data in the initial response beyond the total size is padding
        let first = &first[.. first.len().min(total)];
        let mut received = Vec::with_capacity(total.min(u16::MAX as usize));
        received.extend_from_slice(first);
        Self {toggle: false, last: received.len() == total, received, total}
    }
    /// toggle bit of the next segment
    pub fn toggle(&self) -> bool {self.toggle}
    /// number of bytes received so far
    pub fn received(&self) -> usize {self.received.len()}
    /// true if no more segment is expected
    pub fn complete(&self) -> bool {self.last}
    /// process a received segment, fails with the abort code to send
    pub fn receive(&mut self, header: SdoSegmentHeader, data: &[u8]) -> Result<(), SdoAbortCode> {
        if self.last
            {return Err(SdoAbortCode::UnsupportedCommand)}
        if header.toggle() != self.toggle
            {return Err(SdoAbortCode::BadToggle)}
        if self.received.len() + data.len() > self.total
            {return Err(SdoAbortCode::ServiceTooBig)}
        self.received.extend_from_slice(data);
        self.toggle = ! self.toggle;
        if header.last() {
            if self.received.len() != self.total
                {return Err(SdoAbortCode::ServiceTooSmall)}
            self.last = true;
        }
        Ok(())
    }
    /// the whole data received
    pub fn finish(self) -> Vec<u8> {self.received}
}


/// error reported by a slave during a CoE exchange
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CanError {
    Mailbox(MailboxError),
    Sdo(SdoAbortCode),
}
impl From<MailboxError> for CanError {
    fn from(src: MailboxError) -> Self {CanError::Mailbox(src)}
}
impl fmt::Display for CanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mailbox(error) => write!(f, "mailbox error {}", error),
            Self::Sdo(code) => write!(f, "sdo abort {}", code),
        }
    }
}

/// emergency message sent by a slave, ETG.1000.6 5.6.4
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Emergency {
    pub code: u16,
    pub register: u8,
    pub data: [u8; 5],
}
impl PduData for Emergency {
    const ID: data::TypeId = data::TypeId::CUSTOM;
    type Packed = [u8; 8];

    fn pack(&self, dst: &mut [u8]) -> data::PackingResult<()> {
        let mut cursor = Cursor::new(dst);
        cursor.pack(&self.code)?;
        cursor.pack(&self.register)?;
        cursor.pack(&self.data)
    }
    fn unpack(src: &[u8]) -> data::PackingResult<Self> {
        let mut cursor = Cursor::new(src);
        Ok(Self {
            code: cursor.unpack()?,
            register: cursor.unpack()?,
            data: cursor.unpack()?,
        })
    }
}

/// extract an emergency from a CoE mailbox frame, if it is one
pub fn emergency(frame: &[u8]) -> data::PackingResult<Option<Emergency>> {
    let coe = CoeHeader::unpack(frame)?;
    if coe.service() != CanService::Emergency
        {return Ok(None)}
    Emergency::unpack(&frame[CoeHeader::packed_size() ..]).map(Some)
}


#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub struct CoeHeader {
    /// present in the Can protocol, but not used in CoE
    pub number: u9,
    reserved: u3,
    /// Can command
    pub service: CanService,
}
data::bilge_pdudata!(CoeHeader, u16);

/**
    Type of can service

    receiving and transmiting is from the point of view of the slave:
        - transmitting is slave -> master
        - receiving is master -> slave
*/
#[bitsize(4)]
#[derive(FromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum CanService {
    #[fallback]
    Unknown = 0x0,
    Emergency = 0x1,
    SdoRequest = 0x2,
    SdoResponse = 0x3,
    TransmitPdo = 0x4,
    ReceivePdo = 0x5,
    TransmitPdoRemoteRequest = 0x6,
    ReceivePdoRemoteRequest = 0x7,
    SdoInformation = 0x8,
}


/// Header for operations with SDOs
///
/// ETG.1000.6 5.6.2
#[bitsize(32)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub struct SdoHeader {
    /// true if field `size` is used
    pub sized: bool,
    /// true in case of an expedited transfer (the data size specified by `size`)
    pub expedited: bool,
    /// indicate the data size but not as an integer.
    /// this value shall be `4 - data.len()`
    pub size: u2,
    /// true if a complete SDO is accessed
    pub complete: bool,
    /// operation to perform with the indexed SDO, this should be a value of [SdoCommandRequest] or [SdoCommandResponse]
    pub command: u3,
    /// SDO index
    pub index: u16,
    /**
    - if subitem is accessed: SDO subindex
    - if complete item is accessed:
        + put 0 to include subindex 0 in transmission
        + put 1 to exclude subindex 0 from transmission
    */
    pub sub: u8,
}
data::bilge_pdudata!(SdoHeader, u32);

#[bitsize(8)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub struct SdoSegmentHeader {
    /// true if this is the last segment of the transfer
    pub last: bool,
    /// number of padding bytes in a segment shorter than 7 bytes
    pub size: u3,
    pub toggle: bool,
    pub command: u3,
}
data::bilge_pdudata!(SdoSegmentHeader, u8);

/// request operation to perform with an SDO in CoE
///
/// ETG.1000.6 5.6.2.1-7
#[bitsize(3)]
#[derive(TryFromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum SdoCommandRequest {
    Download = 0x1,
    DownloadSegment = 0x0,
    Upload = 0x2,
    UploadSegment = 0x3,
    Abort = 0x4,
}

/// response operation to perform with an SDO in CoE
///
/// ETG.1000.6 5.6.2.1-7
#[bitsize(3)]
#[derive(TryFromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum SdoCommandResponse {
    Download = 0x3,
    DownloadSegment = 0x1,
    Upload = 0x2,
    UploadSegment = 0x0,
}

data::status_codes! {
    /// reason of an SDO transfer abort
    ///
    /// ETG.1000.6 table 41
    pub enum SdoAbortCode: u32 {
        /// Toggle bit not changed
        BadToggle = 0x05_03_00_00 => "toggle bit not alternated",
        /// SDO protocol timeout
        Timeout = 0x05_04_00_00 => "SDO protocol timed out",
        /// Client/Server command specifier not valid or unknown
        UnsupportedCommand = 0x05_04_00_01 => "client/server command specifier not valid or unknown",
        /// Invalid block size (block mode only)
        InvalidBlockSize = 0x05_04_00_02 => "invalid block size",
        /// Invalid sequence number (block mode only)
        InvalidSequence = 0x05_04_00_03 => "invalid sequence number",
        /// CRC error (block mode only)
        Crc = 0x05_04_00_04 => "CRC error",
        /// Out of memory
        OutOfMemory = 0x05_04_00_05 => "out of memory",
        /// Unsupported access to an object, this is raised when trying to access a complete SDO when complete SDO access is not supported
        UnsupportedAccess = 0x06_01_00_00 => "unsupported access to an object",
        /// Attempt to read to a write only object
        WriteOnly = 0x06_01_00_01 => "attempt to read a write only object",
        /// Attempt to write to a read only object
        ReadOnly = 0x06_01_00_02 => "attempt to write a read only object",
        /// Subindex cannot be written, SI0 must be 0 for write access
        WriteError = 0x06_01_00_03 => "subindex cannot be written, SI0 must be 0 for write access",
        /// SDO Complete access not supported for objects of variable length such as ENUM object types
        VariableLength = 0x06_01_00_04 => "complete access not supported for objects of variable length",
        /// Object length exceeds mailbox size
        ObjectTooBig = 0x06_01_00_05 => "object length exceeds mailbox size",
        /// Object mapped to RxPDO, SDO Download blocked
        LockedByPdo = 0x06_01_00_06 => "object mapped to RxPDO, download blocked",
        /// The object does not exist in the object directory
        InvalidIndex = 0x06_02_00_00 => "object does not exist in the object directory",
        /// The object can not be mapped into the PDO
        CannotMap = 0x06_04_00_41 => "object cannot be mapped into the PDO",
        /// The number and length of the objects to be mapped would exceed the PDO length
        PdoTooSmall = 0x06_04_00_42 => "mapped objects would exceed the PDO length",
        /// General parameter incompatibility reason
        IncompatibleParameter = 0x06_04_00_43 => "general parameter incompatibility",
        /// General internal incompatibility in the device
        IncompatibleDevice = 0x06_04_00_47 => "general internal incompatibility in the device",
        /// Access failed due to a hardware error
        HardwareError = 0x06_06_00_00 => "access failed due to a hardware error",
        /// Data type does not match, length of service parameter does not match
        InvalidLength = 0x06_07_00_10 => "data type does not match, length of service parameter does not match",
        /// Data type does not match, length of service parameter too high
        ServiceTooBig = 0x06_07_00_12 => "data type does not match, length of service parameter too high",
        /// Data type does not match, length of service parameter too low
        ServiceTooSmall = 0x06_07_00_13 => "data type does not match, length of service parameter too low",
        /// Subindex does not exist
        InvalidSubIndex = 0x06_09_00_11 => "subindex does not exist",
        /// Value range of parameter exceeded (only for write access)
        ValueOutOfRange = 0x06_09_00_30 => "value range of parameter exceeded",
        /// Value of parameter written too high
        ValueTooHigh = 0x06_09_00_31 => "value of parameter written too high",
        /// Value of parameter written too low
        ValueTooLow = 0x06_09_00_32 => "value of parameter written too low",
        /// Maximum value is less than minimum value
        InvalidRange = 0x06_09_00_36 => "maximum value is less than minimum value",
        /// General error
        GeneralError = 0x08_00_00_00 => "general error",
        /// Data cannot be transferred or stored to the application
        Refused = 0x08_00_00_20 => "data cannot be transferred or stored to the application",
        /// Data cannot be transferred or stored to the application because of local control
        ApplicationRefused = 0x08_00_00_21 => "data cannot be transferred or stored to the application because of local control",
        /// Data cannot be transferred or stored to the application because of the present device state
        StateRefused = 0x08_00_00_22 => "data cannot be transferred or stored to the application because of the present device state",
        /// Object dictionary dynamic generation fails or no object dictionary is present
        DictionnaryEmpty = 0x08_00_00_23 => "object dictionary dynamic generation fails or no object dictionary is present",
    }
}

impl SdoAbortCode {
    pub fn object_related(self) -> bool   {u32::from(self) >> 24 == 0x06}
    pub fn subitem_related(self) -> bool  {u32::from(self) >> 16 == 0x06_09}
    pub fn mapping_related(self) -> bool  {u32::from(self) >> 16 == 0x06_04}
    pub fn device_related(self) -> bool   {u32::from(self) >> 24 == 0x08}
    pub fn protocol_related(self) -> bool {u32::from(self) >> 24 == 0x05}
}


#[cfg(test)]
mod tests {
    use super::*;

    fn segment(last: bool, toggle: bool) -> SdoSegmentHeader {
        SdoSegmentHeader::new(last, u3::new(0), toggle, u3::from(SdoCommandResponse::UploadSegment))
    }

    #[test]
    fn segmented_transfer() {
        let mut transfer = SegmentedTransfer::new(10, &[0, 1, 2, 3]);
        assert!(! transfer.complete());
        assert!(! transfer.toggle());
        transfer.receive(segment(false, false), &[4, 5, 6]).unwrap();
        assert!(transfer.toggle());
        transfer.receive(segment(true, true), &[7, 8, 9]).unwrap();
        assert!(transfer.complete());
        assert_eq!(transfer.finish(), (0 .. 10).collect::<Vec<u8>>());
    }

    #[test]
    fn segmented_transfer_errors() {
        let mut transfer = SegmentedTransfer::new(10, &[0, 1, 2, 3]);
        assert_eq!(transfer.receive(segment(false, true), &[4]), Err(SdoAbortCode::BadToggle));
        assert_eq!(transfer.receive(segment(false, false), &[0; 7]), Err(SdoAbortCode::ServiceTooBig));
        assert_eq!(transfer.receive(segment(true, false), &[4]), Err(SdoAbortCode::ServiceTooSmall));
        // the whole data in the initial response
        assert!(SegmentedTransfer::new(2, &[1, 2, 0, 0]).complete());
    }

    #[test]
    fn segment_padding() {
        let header = SdoSegmentHeader::new(true, u3::new(4), false, u3::new(0));
        assert_eq!(segment_data(header, &[1, 2, 3, 0, 0, 0, 0]), &[1, 2, 3]);
        assert_eq!(segment_data(header, &[1; 9]).len(), 9);
    }

    #[test]
    fn sdo_header_layout() {
        let mut packed = [0; 4];
        SdoHeader::new(false, false, u2::new(0), false, u3::from(SdoCommandRequest::Upload), 0x1018, 1)
            .pack(&mut packed).unwrap();
        assert_eq!(packed, [0x40, 0x18, 0x10, 0x01]);
        assert_eq!(SdoAbortCode::from(0x0602_0000), SdoAbortCode::InvalidIndex);
    }
}
