use crate::{
    rawmaster::{RawMaster, SlaveAddress},
    registers::{self, AlControl, AlStatus, AlError},
    config::PollBackoff,
    eeprom::MailboxTypes,
    error::{EthercatError, EthercatResult},
    };
use core::{ops::Range, time::Duration};
use tokio::time::Instant;
use log::{debug, warn};



pub type CommunicationState = registers::AlState;
use registers::AlState::*;


/**
    snapshot of what the master knows about a slave

    slaves are numbered by their position in the segment (starting from 0), and addressed by their station address (`position + 1`)
*/
#[derive(Clone, Debug, PartialEq)]
pub struct SlaveInfo {
    /// position in the segment
    pub position: u16,
    /// station address assigned by the master
    pub station: u16,
    pub alias: u16,
    pub vendor: u32,
    pub product: u32,
    pub revision: u32,
    pub serial: u32,
    pub name: String,
    /// last state read
    pub state: CommunicationState,
    /// last state requested
    pub requested: CommunicationState,
    /// last AL status code read
    pub status_code: AlError,
    /// true if the error flag of the AL status was set at last read
    pub error: bool,
    pub output_bits: u32,
    pub input_bits: u32,
    /// view of the outputs in the process image
    pub outputs: Range<usize>,
    /// view of the inputs in the process image
    pub inputs: Range<usize>,
    /// propagation delay from the reference clock, for slaves supporting DC
    pub delay: Option<u32>,
    pub dc: bool,
    /// position of the slave this one is connected to
    pub parent: Option<u16>,
    /// offset and size of the mailbox from master to slave
    pub mailbox_write: (u16, u16),
    /// offset and size of the mailbox from slave to master
    pub mailbox_read: (u16, u16),
    pub protocols: MailboxTypes,
    pub group: u8,
    /// identity could not be read during configuration, defaults were used
    pub degraded: bool,
}
impl SlaveInfo {
    /// info of a slave known only by its position
    pub fn new(position: u16, station: u16) -> Self {
        Self {
            position,
            station,
            alias: 0,
            vendor: 0,
            product: 0,
            revision: 0,
            serial: 0,
            name: String::new(),
            state: Unknown,
            requested: Init,
            status_code: AlError::NoError,
            error: false,
            output_bits: 0,
            input_bits: 0,
            outputs: 0 .. 0,
            inputs: 0 .. 0,
            delay: None,
            dc: false,
            parent: None,
            mailbox_write: (0, 0),
            mailbox_read: (0, 0),
            protocols: MailboxTypes::default(),
            group: 0,
            degraded: false,
        }
    }
    pub fn output_bytes(&self) -> usize {crate::mapping::bytes(self.output_bits)}
    pub fn input_bytes(&self) -> usize {crate::mapping::bytes(self.input_bits)}
    /// true if the slave has a mailbox
    pub fn has_mailbox(&self) -> bool {self.mailbox_write.1 != 0 && self.mailbox_read.1 != 0}
}


/**
    This struct exposes the AL state machine of one slave.

    A state change is requested by writing the AL control register, then the AL status register is polled until the slave reports the requested state or an error. A slave showing the error flag must have its error acknowledged before it accepts a new request.
*/
pub struct Slave<'a> {
    master: &'a RawMaster,
    station: u16,
    backoff: PollBackoff,
}
impl<'a> Slave<'a> {
    pub fn new(master: &'a RawMaster, station: u16, backoff: PollBackoff) -> Self {
        Self {master, station, backoff}
    }

    /// get the address used to communicate with the slave
    pub fn address(&self) -> SlaveAddress  {SlaveAddress::Fixed(self.station)}

    /// current AL status and status code of the slave
    pub async fn status(&self) -> EthercatResult<(AlStatus, AlError)> {
        let status = self.master.fprd(self.station, registers::al::status).await?.one()?;
        let code = if status.error()
            {AlError::from(self.master.fprd(self.station, registers::al::error).await?.one()?)}
            else {AlError::NoError};
        Ok((status, code))
    }
    /// send a state change request to the slave, without waiting for it
    pub async fn request(&self, target: CommunicationState) -> EthercatResult {
        self.master.fpwr(self.station, registers::al::control, AlControl::new(target, false, false)).await?.one()
    }
    /// acknowledge the error flag of the slave in its current state
    pub async fn acknowledge(&self, current: CommunicationState) -> EthercatResult {
        debug!("slave {:#x}: acknowledging error in {:?}", self.station, current);
        self.master.fpwr(self.station, registers::al::control, AlControl::new(current, true, false)).await?.one()
    }

    /**
        poll the slave state until it reaches `target` or `timeout` elapses, waiting longer and longer between polls

        returns the last state read, which is not the target if the timeout elapsed
    */
    pub async fn check(&self, target: CommunicationState, timeout: Duration) -> EthercatResult<AlStatus> {
        let deadline = Instant::now() + timeout;
        let mut delay = self.backoff.start();
        loop {
            let status = self.master.fprd(self.station, registers::al::status).await?;
            if status.answers == 1 && status.value.state() == target
                {return Ok(status.value)}
            if ! self.backoff.wait(&mut delay, deadline).await {
                if status.answers != 1
                    {return Err(EthercatError::Timeout("slave not answering state checks"))}
                return Ok(status.value);
            }
        }
    }

    /**
        send a state change request to the slave, and return once the slave has switched

        a pending error is acknowledged first. If the slave refuses the change or it does not happen before `timeout`, the AL status code reported by the slave is returned as error.
    */
    pub async fn switch(&self, target: CommunicationState, timeout: Duration) -> EthercatResult<AlStatus, AlError> {
        let deadline = Instant::now() + timeout;
        let (status, code) = self.status().await?;
        if status.error() {
            debug!("slave {:#x}: pending error {} before switching to {:?}", self.station, code, target);
            self.acknowledge(status.state()).await?;
        }
        self.request(target).await?;

        let mut delay = self.backoff.start();
        loop {
            let status = self.master.fprd(self.station, registers::al::status).await?;
            if status.answers == 1 {
                if status.value.state() == target && ! status.value.error()
                    {return Ok(status.value)}
                if status.value.error() {
                    let code = AlError::from(self.master.fprd(self.station, registers::al::error).await?.one()?);
                    warn!("slave {:#x}: refused {:?}, staying in {:?}: {}", self.station, target, status.value.state(), code);
                    return Err(EthercatError::Slave(self.address(), code));
                }
            }
            if ! self.backoff.wait(&mut delay, deadline).await {
                warn!("slave {:#x}: did not reach {:?} in time", self.station, target);
                let (_, code) = self.status().await?;
                if code != AlError::NoError
                    {return Err(EthercatError::Slave(self.address(), code))}
                return Err(EthercatError::Timeout("slave did not reach requested state"));
            }
        }
    }
}
