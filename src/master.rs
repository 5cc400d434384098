/*!
    This module provides [Master], the context of one ethercat segment: it owns the socket, the slaves descriptors and the process image, and exposes every operation available on the segment.
*/

use core::time::Duration;
use std::{collections::BTreeSet, sync::Arc};
use tokio::time::Instant;
use futures_concurrency::future::Join;
use log::{debug, info, warn};

use crate::{
    socket::{EthercatSocket, RedundantSocket, Port},
    rawmaster::{RawMaster, PduCommand, SlaveAddress},
    registers::{self, AlControl, AlState, AlError, DLStatus, SiiAccess, SiiOwner, SyncManagerChannel, SyncMode, SyncDirection, SyncActivation},
    eeprom::{self, CategorySyncManager},
    sii::{self, Sii},
    config::MasterConfig,
    mailbox::{Mailbox, MailboxType},
    can::{self, Can, CanError},
    servo::{Servo, ServoError},
    sdo::Sdo,
    mapping::{self, Layout, ProcessData},
    clock,
    slave::{Slave, SlaveInfo},
    diagnostics::{Diagnostics, Event, Record},
    data::PduData,
    error::{EthercatError, EthercatResult},
    };


/// station address given temporarily to a slave while checking its identity during recovery
const TEMPORARY_STATION: u16 = 0xffff;

/// lifecycle of a [Master]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Stage {
    /// socket opened, slaves not yet discovered
    Open,
    /// slaves discovered and addressed
    Configured,
    /// no more operation possible
    Closed,
}

/// everything the master keeps about a slave
struct Entry {
    info: SlaveInfo,
    /// DL status read at configuration, used for topology
    status: DLStatus,
    sync_managers: Vec<CategorySyncManager>,
    mailbox: Option<Mailbox>,
}

/**
    Main object of this crate, the context of one ethercat segment.

    It owns the socket used to talk to the segment, the descriptors of every slave found on it and the process image exchanged with them. Slaves are designated by their station address, which the master assigns densely from `1` in the order of the slaves on the segment.

    A typical use looks like

    ```ignore
    let mut master = Master::open(socket, MasterConfig::default());
    master.configure().await?;
    master.request_state_all(AlState::PreOperational, timeout).await?;
    master.map().await?;
    master.request_state_all(AlState::SafeOperational, timeout).await?;
    master.request_state_all(AlState::Operational, timeout).await?;
    loop {
        master.outputs(1)?.copy_from_slice(&[0x12, 0x34]);
        let answers = master.exchange(timeout).await?;
        ...
    }
    ```

    ## Note

    Every operation takes `&mut self`, so all datagrams, mailbox transfers and cyclic exchanges of one segment are serialized. Mailbox transfers therefore never interleave with a cyclic exchange, the user task decides when each happens. Several masters on different sockets are independent.
*/
pub struct Master {
    raw: Arc<RawMaster>,
    config: MasterConfig,
    /// active port of the redundant socket, if any
    redundancy: Option<Box<dyn Fn() -> Port + Send + Sync>>,
    stage: Stage,
    slaves: Vec<Entry>,
    layout: Layout,
    /// groups whose slaves are programmed for the current layout
    mapped: BTreeSet<u8>,
    image: Vec<u8>,
    dc_configured: bool,
    /// station address of the reference clock
    reference: Option<u16>,
    diagnostics: Diagnostics,
}

impl Master {
    /// open a segment on the given socket, no datagram is sent before [Self::configure]
    pub fn open<S: EthercatSocket + Send + Sync + 'static>(socket: S, config: MasterConfig) -> Self {
        Self::build(RawMaster::new(socket, config.timeout), config, None)
    }
    /**
        open a segment reachable by two sockets, one at each end of the segment

        frames are sent on the primary socket until it fails, then on the secondary one. See [RedundantSocket]
    */
    pub fn open_redundant<P, S>(primary: P, secondary: S, config: MasterConfig) -> Self
    where
        P: EthercatSocket + Send + Sync + 'static,
        S: EthercatSocket + Send + Sync + 'static,
    {
        let socket = Arc::new(RedundantSocket::new(primary, secondary));
        let ports = socket.clone();
        Self::build(RawMaster::new(socket, config.timeout), config, Some(Box::new(move || ports.active())))
    }
    fn build(raw: RawMaster, config: MasterConfig, redundancy: Option<Box<dyn Fn() -> Port + Send + Sync>>) -> Self {
        Self {
            raw: Arc::new(raw),
            config,
            redundancy,
            stage: Stage::Open,
            slaves: Vec::new(),
            layout: Layout::default(),
            mapped: BTreeSet::new(),
            image: Vec::new(),
            dc_configured: false,
            reference: None,
            diagnostics: Diagnostics::new(),
        }
    }
    /// port currently sending frames, `None` if the segment is not redundant
    pub fn redundancy(&self) -> Option<Port> {
        self.redundancy.as_ref().map(|active| active())
    }
    /// close the segment, every later operation fails
    pub fn close(&mut self) {
        if self.stage != Stage::Closed
            {info!("closing segment with {} slaves", self.slaves.len())}
        self.stage = Stage::Closed;
        self.slaves.clear();
        self.layout = Layout::default();
        self.mapped.clear();
        self.image.clear();
        self.reference = None;
    }
    pub fn stage(&self) -> Stage {self.stage}
    pub fn config(&self) -> &MasterConfig {&self.config}

    fn check_open(&self) -> EthercatResult {
        match self.stage {
            Stage::Closed => Err(EthercatError::Master("segment is closed")),
            _ => Ok(()),
        }
    }
    fn check_configured(&self) -> EthercatResult {
        match self.stage {
            Stage::Configured => Ok(()),
            Stage::Open => Err(EthercatError::Master("segment is not configured")),
            Stage::Closed => Err(EthercatError::Master("segment is closed")),
        }
    }
    /// index of a slave in the descriptors from its station address
    fn index(&self, slave: u16) -> EthercatResult<usize> {
        self.check_configured()?;
        usize::from(slave).checked_sub(1)
            .filter(|&index| index < self.slaves.len())
            .ok_or(EthercatError::Master("no slave with this station address"))
    }

    /**
        discover and address the slaves on the segment

        every slave is reset to INIT with no sync manager, FMMU or sync signal configured, then gets its station address (its position + 1) and has its EEPROM read. Slaves with an unreadable EEPROM are kept with a default identity and marked degraded.

        returns the number of slaves found, [EthercatError::NoSlaves] if none answered. Configuration can be run again, which forgets the previous one.
    */
    pub async fn configure(&mut self) -> EthercatResult<usize> {
        self.check_open()?;
        let raw = self.raw.clone();
        let (control, fmmu, sync, activation, access) = (
            raw.bwr(registers::al::control, AlControl::new(AlState::Init, true, false)),
            raw.bwr(registers::fmmu_area, [0; 0x100]),
            raw.bwr(registers::sync_manager_area, [0; 0x80]),
            raw.bwr(registers::dc::sync_activation, SyncActivation::OFF),
            raw.bwr(registers::sii::access, SiiAccess::new(SiiOwner::EthercatDL, false, false)),
            ).join().await;
        control?;
        fmmu?;
        sync?;
        activation?;
        access?;

        let count = raw.brd(registers::al::status).await?.answers;
        if count == 0 {
            warn!("no slave found on the segment");
            return Err(EthercatError::NoSlaves);
        }
        info!("{} slaves found on the segment", count);

        self.slaves.clear();
        self.layout = Layout::default();
        self.mapped.clear();
        self.image.clear();
        self.dc_configured = false;
        self.reference = None;

        let mut slaves = Vec::with_capacity(usize::from(count));
        for position in 0 .. count {
            slaves.push(self.discover(position).await?);
        }
        let statuses = slaves.iter().map(|entry| entry.status).collect::<Vec<_>>();
        for (entry, parent) in slaves.iter_mut().zip(clock::parents(&statuses)) {
            entry.info.parent = parent.and_then(|parent| u16::try_from(parent).ok());
        }
        for entry in &slaves {
            info!("slave {:#x}: {} vendor {:#x} product {:#x} revision {:#x} serial {:#x}, {} output bits, {} input bits{}",
                entry.info.station, entry.info.name,
                entry.info.vendor, entry.info.product, entry.info.revision, entry.info.serial,
                entry.info.output_bits, entry.info.input_bits,
                if entry.info.degraded {" (degraded)"} else {""});
        }
        self.slaves = slaves;
        self.stage = Stage::Configured;
        Ok(usize::from(count))
    }

    /// address the slave at the given position and read everything needed to use it
    async fn discover(&self, position: u16) -> EthercatResult<Entry> {
        let raw = &self.raw;
        let station = position + 1;
        raw.apwr(position, registers::address::fixed, station).await?.one()?;

        let mut info = SlaveInfo::new(position, station);
        let (alias, features, status) = (
            raw.fprd(station, registers::address::alias),
            raw.fprd(station, registers::esc_features),
            raw.fprd(station, registers::dl::status),
            ).join().await;
        info.alias = alias?.one()?;
        info.dc = features?.one()?.distributed_clock();
        let status = status?.one()?;

        let mut sync_managers = Vec::new();
        match Sii::new(raw, station, self.config.eeprom_timeout).info().await {
            Ok(sii) => {
                if info.alias == 0
                    {info.alias = sii.alias}
                info.vendor = sii.vendor;
                info.product = sii.product;
                info.revision = sii.revision;
                info.serial = sii.serial;
                info.name = sii.name.unwrap_or_else(|| sii::default_name(sii.vendor, sii.product));
                info.mailbox_write = sii.mailbox_write;
                info.mailbox_read = sii.mailbox_read;
                info.protocols = sii.protocols;
                info.output_bits = sii.output_bits;
                info.input_bits = sii.input_bits;
                sync_managers = sii.sync_managers;
            },
            Err(error) => {
                warn!("slave {:#x}: cannot read identity, using defaults: {}", station, error);
                info.degraded = true;
                info.name = sii::default_name(0, 0);
            },
        }

        let mailbox = if info.has_mailbox() {
            self.program_mailbox(&info).await?;
            Some(Mailbox::new(raw.clone(), station, info.mailbox_write, info.mailbox_read, self.config.backoff))
        }
        else {None};

        let (al, code) = Slave::new(raw, station, self.config.backoff).status().await?;
        info.state = al.state();
        info.error = al.error();
        info.status_code = code;
        debug!("slave {:#x}: at position {} in {:?}", station, position, info.state);
        Ok(Entry {info, status, sync_managers, mailbox})
    }

    /// program the mailbox sync managers declared in a slave's EEPROM
    async fn program_mailbox(&self, info: &SlaveInfo) -> EthercatResult {
        let interface = registers::sync_manager::interface;
        self.raw.fpwr(info.station, interface.mailbox_write(), SyncManagerChannel::configured(
                info.mailbox_write.0, info.mailbox_write.1, SyncMode::Mailbox, SyncDirection::Write,
            )).await?.one()?;
        self.raw.fpwr(info.station, interface.mailbox_read(), SyncManagerChannel::configured(
                info.mailbox_read.0, info.mailbox_read.1, SyncMode::Mailbox, SyncDirection::Read,
            )).await?.one()?;
        Ok(())
    }

    /// assign a slave to a synchronization group, the mapping has to be done again
    pub fn set_group(&mut self, slave: u16, group: u8) -> EthercatResult {
        let index = self.index(slave)?;
        self.slaves[index].info.group = group;
        self.invalidate();
        Ok(())
    }
    /// override the process data sizes read from a slave's EEPROM, the mapping has to be done again
    pub fn set_process_data(&mut self, slave: u16, output_bits: u32, input_bits: u32) -> EthercatResult {
        let index = self.index(slave)?;
        let info = &mut self.slaves[index].info;
        info.output_bits = output_bits;
        info.input_bits = input_bits;
        self.invalidate();
        Ok(())
    }
    fn invalidate(&mut self) {
        self.layout = Layout::default();
        self.mapped.clear();
    }

    /**
        map the process data of every group in the process image

        returns the size of the image. The distributed clocks are configured at the same time if they were not yet.
    */
    pub async fn map(&mut self) -> EthercatResult<usize> {
        self.check_configured()?;
        self.compute_layout()?;
        let groups = self.layout.groups.iter().map(|group| group.id).collect::<Vec<_>>();
        for group in groups {
            self.program(group).await?;
        }
        if ! self.dc_configured
            {self.configure_dc().await?;}
        info!("process image of {} bytes mapped", self.layout.size);
        Ok(self.layout.size)
    }
    /**
        map the process data of one group in the process image

        returns the size of the group's part of the image and the working counter expected when exchanging it
    */
    pub async fn map_group(&mut self, group: u8) -> EthercatResult<(usize, u16)> {
        self.check_configured()?;
        self.compute_layout()?;
        let (size, expected) = self.layout.group(group)
            .map(|layout| (layout.range.len(), layout.expected_wc()))
            .ok_or(EthercatError::Master("no slave in this group"))?;
        self.program(group).await?;
        if ! self.dc_configured
            {self.configure_dc().await?;}
        Ok((size, expected))
    }

    fn compute_layout(&mut self) -> EthercatResult {
        let slaves = self.slaves.iter()
            .map(|entry| ProcessData {
                station: entry.info.station,
                group: entry.info.group,
                output_bits: entry.info.output_bits,
                input_bits: entry.info.input_bits,
            })
            .collect::<Vec<_>>();
        let layout = Layout::compute(&slaves, self.raw.max_pdu(), self.config.image_capacity)?;
        if layout != self.layout {
            self.mapped.clear();
            self.image = vec![0; layout.size];
            for entry in &mut self.slaves {
                let region = layout.region(entry.info.station).cloned().unwrap_or_default();
                entry.info.outputs = region.outputs;
                entry.info.inputs = region.inputs;
            }
            self.layout = layout;
        }
        Ok(())
    }

    /// program the slaves of a group for the current layout
    async fn program(&mut self, group: u8) -> EthercatResult {
        let layout = self.layout.group(group)
            .ok_or(EthercatError::Master("no slave in this group"))?;
        for (station, region) in &layout.slaves {
            let entry = self.slaves.iter()
                .find(|entry| entry.info.station == *station)
                .ok_or(EthercatError::Master("slave in layout is not on the segment"))?;
            mapping::configure_slave(&self.raw, *station, region, &entry.sync_managers).await?;
        }
        debug!("group {} mapped at {:?}, expecting working counter {}", group, layout.range, layout.expected_wc());
        self.mapped.insert(group);
        Ok(())
    }

    /**
        exchange the process data of a group with the slaves

        outputs of the group are sent from the image and inputs received are written in the image. Only the datagrams that came back before `timeout` update the image.

        returns the working counter, summed over the datagrams of the group. A working counter lower than [Self::expected_wc] means some slaves did not process their data: it is logged and recorded in diagnostics, but handling it is up to the caller.
    */
    pub async fn exchange_group(&mut self, group: u8, timeout: Duration) -> EthercatResult<u16> {
        self.check_configured()?;
        if ! self.mapped.contains(&group)
            {return Err(EthercatError::Master("group is not mapped"))}
        let layout = self.layout.group(group)
            .ok_or(EthercatError::Master("no slave in this group"))?;
        let deadline = Instant::now() + timeout;

        let mut received = 0u16;
        let mut buffer = Vec::new();
        for datagram in &layout.datagrams {
            buffer.clear();
            buffer.extend_from_slice(&self.image[datagram.range.clone()]);
            let logical = u32::try_from(datagram.range.start)
                .map_err(|_| EthercatError::Master("process image beyond logical memory"))?;
            let (slave_address, memory_address) = SlaveAddress::Logical(logical).split(0)?;
            let remain = deadline.saturating_duration_since(Instant::now());
            let answers = self.raw.pdu(PduCommand::LRW, slave_address, memory_address, &mut buffer, remain).await?;
            if answers != 0 {
                let start = datagram.range.start;
                for (_, region) in &layout.slaves {
                    let inputs = region.inputs.start.max(start) .. region.inputs.end.min(datagram.range.end);
                    if inputs.start < inputs.end {
                        self.image[inputs.clone()].copy_from_slice(&buffer[inputs.start - start .. inputs.end - start]);
                    }
                }
            }
            received = received.saturating_add(answers);
        }

        let expected = layout.expected_wc();
        if received < expected {
            warn!("group {}: working counter {} instead of {}", group, received, expected);
            self.diagnostics.push(None, Event::WorkingCounter {group, expected, received});
        }
        Ok(received)
    }
    /// exchange the process data of every mapped group, returns the working counters summed over groups
    pub async fn exchange(&mut self, timeout: Duration) -> EthercatResult<u16> {
        self.check_configured()?;
        if self.mapped.is_empty()
            {return Err(EthercatError::Master("no group is mapped"))}
        let deadline = Instant::now() + timeout;
        let groups = self.mapped.iter().copied().collect::<Vec<_>>();
        let mut received = 0u16;
        for group in groups {
            let remain = deadline.saturating_duration_since(Instant::now());
            received = received.saturating_add(self.exchange_group(group, remain).await?);
        }
        Ok(received)
    }

    /**
        read the AL status of every slave and update their descriptors

        returns the lowest state on the segment. A slave not answering is reported in [AlState::Unknown]
    */
    pub async fn read_state(&mut self) -> EthercatResult<AlState> {
        self.check_configured()?;
        let mut lowest = AlState::Operational;
        for entry in self.slaves.iter_mut() {
            let info = &mut entry.info;
            match Slave::new(&self.raw, info.station, self.config.backoff).status().await {
                Ok((status, code)) => {
                    if status.error() && ! (info.error && info.status_code == code) {
                        warn!("slave {:#x}: error {} in {:?}", info.station, code, status.state());
                        self.diagnostics.push(Some(info.station), Event::AlStatus {state: status.state(), code});
                    }
                    info.state = status.state();
                    info.error = status.error();
                    info.status_code = code;
                },
                Err(error) => {
                    debug!("slave {:#x}: cannot read state: {}", info.station, error);
                    info.state = AlState::Unknown;
                },
            }
            lowest = lowest.min(info.state);
        }
        Ok(lowest)
    }
    /// send a state request to a slave without waiting for it
    pub async fn write_state(&mut self, slave: u16, state: AlState) -> EthercatResult {
        let index = self.index(slave)?;
        Slave::new(&self.raw, slave, self.config.backoff).request(state).await?;
        self.slaves[index].info.requested = state;
        Ok(())
    }
    /// send a state request to every slave at once, without waiting for them
    pub async fn write_state_all(&mut self, state: AlState) -> EthercatResult {
        self.check_configured()?;
        let answers = self.raw.bwr(registers::al::control, AlControl::new(state, false, false)).await?.answers;
        if usize::from(answers) != self.slaves.len()
            {warn!("{} slaves received request for {:?} out of {}", answers, state, self.slaves.len())}
        for entry in &mut self.slaves {
            entry.info.requested = state;
        }
        Ok(())
    }
    /**
        wait for a slave to reach `state`, polling with growing delays

        returns the last state read, which is not the expected one if `timeout` elapsed
    */
    pub async fn state_check(&mut self, slave: u16, state: AlState, timeout: Duration) -> EthercatResult<AlState> {
        let index = self.index(slave)?;
        let status = Slave::new(&self.raw, slave, self.config.backoff).check(state, timeout).await?;
        let info = &mut self.slaves[index].info;
        info.state = status.state();
        info.error = status.error();
        Ok(info.state)
    }
    /**
        bring a slave to the given state, and wait for it

        a pending error is acknowledged before the request. On failure the AL status code reported by the slave is returned and recorded in diagnostics.

        ## Note

        a slave with process data cannot be requested SAFE-OP or OP before its group is mapped
    */
    pub async fn request_state(&mut self, slave: u16, state: AlState, timeout: Duration) -> EthercatResult<AlState, AlError> {
        let index = self.index(slave)?;
        let info = &self.slaves[index].info;
        if state >= AlState::SafeOperational
        && (info.output_bits != 0 || info.input_bits != 0)
        && ! self.mapped.contains(&info.group)
            {return Err(EthercatError::Master("process data must be mapped before SAFE-OP"))}

        let control = Slave::new(&self.raw, slave, self.config.backoff);
        let result = control.switch(state, timeout).await;
        let info = &mut self.slaves[index].info;
        info.requested = state;
        match result {
            Ok(status) => {
                info.state = status.state();
                info.error = false;
                info.status_code = AlError::NoError;
                Ok(info.state)
            },
            Err(EthercatError::Slave(address, code)) => {
                if let Ok((status, _)) = control.status().await {
                    info.state = status.state();
                    info.error = status.error();
                }
                info.status_code = code;
                self.diagnostics.push(Some(slave), Event::AlStatus {state: info.state, code});
                Err(EthercatError::Slave(address, code))
            },
            Err(error) => Err(error),
        }
    }
    /**
        bring every slave to the given state, one after the other

        a slave failing does not prevent the others from switching, its failure is logged and recorded in diagnostics. Returns the lowest state reached.
    */
    pub async fn request_state_all(&mut self, state: AlState, timeout: Duration) -> EthercatResult<AlState> {
        self.check_configured()?;
        let deadline = Instant::now() + timeout;
        let stations = self.slaves.iter().map(|entry| entry.info.station).collect::<Vec<_>>();
        for station in stations {
            let remain = deadline.saturating_duration_since(Instant::now());
            if let Err(error) = self.request_state(station, state, remain).await {
                warn!("slave {:#x}: cannot switch to {:?}: {}", station, state, error);
            }
        }
        Ok(self.slaves.iter()
            .map(|entry| entry.info.state)
            .min()
            .unwrap_or(AlState::Unknown))
    }

    /**
        configure a slave again from scratch, and bring it back to the state last requested

        the slave goes to INIT, has its identity read again and its mailbox and process data programmed, then walks up to its requested state. Other slaves are not disturbed. The identity read must match the one found during configuration.
    */
    pub async fn reconfigure(&mut self, slave: u16, timeout: Duration) -> EthercatResult<AlState, AlError> {
        let index = self.index(slave)?;
        let deadline = Instant::now() + timeout;
        let remain = || deadline.saturating_duration_since(Instant::now());
        let target = self.slaves[index].info.requested;
        info!("slave {:#x}: reconfiguring towards {:?}", slave, target);

        self.request_state(slave, AlState::Init, remain()).await?;
        self.refresh_identity(index).await?;

        if target >= AlState::PreOperational
            {self.request_state(slave, AlState::PreOperational, remain()).await?;}
        let group = self.slaves[index].info.group;
        if self.mapped.contains(&group) {
            let region = self.layout.region(slave).cloned().unwrap_or_default();
            mapping::configure_slave(&self.raw, slave, &region, &self.slaves[index].sync_managers).await?;
        }
        if target >= AlState::SafeOperational
            {self.request_state(slave, AlState::SafeOperational, remain()).await?;}
        if target >= AlState::Operational
            {self.request_state(slave, AlState::Operational, remain()).await?;}
        Ok(self.slaves[index].info.state)
    }

    /// read the EEPROM of a slave again, and program its mailbox
    async fn refresh_identity(&mut self, index: usize) -> EthercatResult {
        let station = self.slaves[index].info.station;
        let sii = Sii::new(&self.raw, station, self.config.eeprom_timeout).info().await?;
        let entry = &mut self.slaves[index];
        if ! entry.info.degraded
        && (sii.vendor, sii.product, sii.revision, sii.serial)
            != (entry.info.vendor, entry.info.product, entry.info.revision, entry.info.serial)
            {return Err(EthercatError::Master("slave identity changed since configuration"))}
        if entry.info.degraded {
            entry.info.vendor = sii.vendor;
            entry.info.product = sii.product;
            entry.info.revision = sii.revision;
            entry.info.serial = sii.serial;
            entry.info.name = sii.name.unwrap_or_else(|| sii::default_name(sii.vendor, sii.product));
            entry.info.degraded = false;
        }
        entry.info.mailbox_write = sii.mailbox_write;
        entry.info.mailbox_read = sii.mailbox_read;
        entry.info.protocols = sii.protocols;
        entry.sync_managers = sii.sync_managers;
        entry.mailbox = if entry.info.has_mailbox() {
            Some(Mailbox::new(self.raw.clone(), station, entry.info.mailbox_write, entry.info.mailbox_read, self.config.backoff))
        }
        else {None};
        if self.slaves[index].mailbox.is_some() {
            self.program_mailbox(&self.slaves[index].info).await?;
        }
        Ok(())
    }

    /**
        give back its station address to a slave that lost it (for instance after a power cycle), then [Self::reconfigure] it

        the slave at the expected position must have the identity found during configuration, else it is left unaddressed
    */
    pub async fn recover(&mut self, slave: u16, timeout: Duration) -> EthercatResult<AlState, AlError> {
        let index = self.index(slave)?;
        let deadline = Instant::now() + timeout;
        let position = self.slaves[index].info.position;

        let current = self.raw.fprd(slave, registers::address::fixed).await?;
        match current.answers {
            0 => {},
            1 if current.value == slave => {
                debug!("slave {:#x}: still addressed", slave);
                return self.reconfigure(slave, deadline.saturating_duration_since(Instant::now())).await;
            },
            _ => return Err(EthercatError::Protocol("several slaves answer the same station address")),
        }

        let found = self.raw.aprd(position, registers::address::fixed).await?.one()?;
        debug!("slave at position {} has address {:#x} instead of {:#x}", position, found, slave);
        self.raw.apwr(position, registers::address::fixed, TEMPORARY_STATION).await?.one()?;
        let identity = match self.temporary_identity().await {
            Ok(identity) => identity,
            Err(error) => {
                warn!("slave at position {}: cannot read its identity: {}", position, error);
                self.raw.apwr(position, registers::address::fixed, 0).await?;
                return Err(error.upgrade());
            },
        };
        let info = &self.slaves[index].info;
        if ! info.degraded && identity != (info.vendor, info.product, info.revision) {
            warn!("slave at position {} is not the one configured", position);
            self.raw.apwr(position, registers::address::fixed, 0).await?;
            return Err(EthercatError::Master("another slave is at this position"));
        }
        self.raw.fpwr(TEMPORARY_STATION, registers::address::fixed, slave).await?.one()?;
        info!("slave {:#x}: address recovered", slave);
        self.reconfigure(slave, deadline.saturating_duration_since(Instant::now())).await
    }

    /// vendor, product and revision of the slave at the temporary station address
    async fn temporary_identity(&self) -> EthercatResult<(u32, u32, u32)> {
        let sii = Sii::new(&self.raw, TEMPORARY_STATION, self.config.eeprom_timeout);
        Ok((
            sii.read(eeprom::device::vendor).await?,
            sii.read(eeprom::device::product).await?,
            sii.read(eeprom::device::revision).await?,
            ))
    }

    /// mailbox of a slave supporting the given protocol
    fn mailbox(&mut self, index: usize, supported: bool) -> EthercatResult<&mut Mailbox> {
        if ! supported
            {return Err(EthercatError::Master("slave does not support this mailbox protocol"))}
        self.slaves[index].mailbox.as_mut()
            .ok_or(EthercatError::Master("slave has no mailbox"))
    }

    /**
        read an object of a slave's dictionary using CoE

        `complete` reads all the subitems of the object at once, starting from `sub`. Transfers of any size are supported, expedited, normal or segmented depending on what the slave answers.
    */
    pub async fn sdo_read(&mut self, slave: u16, index: u16, sub: u8, complete: bool, timeout: Duration) -> EthercatResult<Vec<u8>, CanError> {
        let position = self.index(slave)?;
        let supported = self.slaves[position].info.protocols.can();
        let mut can = Can::new(self.mailbox(position, supported)?);
        let result = can.sdo_read(index, sub, complete, timeout).await;
        let emergencies = core::mem::take(&mut can.emergencies);
        self.record_emergencies(slave, emergencies);
        self.record_can(slave, index, sub, &result);
        result
    }
    /**
        write an object of a slave's dictionary using CoE

        `complete` writes all the subitems of the object at once, starting from `sub`
    */
    pub async fn sdo_write(&mut self, slave: u16, index: u16, sub: u8, complete: bool, data: &[u8], timeout: Duration) -> EthercatResult<(), CanError> {
        let position = self.index(slave)?;
        let supported = self.slaves[position].info.protocols.can();
        let mut can = Can::new(self.mailbox(position, supported)?);
        let result = can.sdo_write(index, sub, complete, data, timeout).await;
        let emergencies = core::mem::take(&mut can.emergencies);
        self.record_emergencies(slave, emergencies);
        self.record_can(slave, index, sub, &result);
        result
    }
    /// read a typed value from a slave's dictionary
    pub async fn sdo_get<T: PduData>(&mut self, slave: u16, sdo: &Sdo<T>, timeout: Duration) -> EthercatResult<T, CanError> {
        let data = self.sdo_read(slave, sdo.index, sdo.sub.unwrap(), sdo.sub.is_complete(), timeout).await?;
        Ok(sdo.field.get(&data)?)
    }
    /// write a typed value to a slave's dictionary, the rest of the object is read first if the value does not start it
    pub async fn sdo_set<T: PduData>(&mut self, slave: u16, sdo: &Sdo<T>, value: T, timeout: Duration) -> EthercatResult<(), CanError> {
        let deadline = Instant::now() + timeout;
        let (sub, complete) = (sdo.sub.unwrap(), sdo.sub.is_complete());
        let mut data = if sdo.field.byte == 0 {
            vec![0; sdo.transfer_size()]
        }
        else {
            let mut current = self.sdo_read(slave, sdo.index, sub, complete, timeout).await?;
            current.resize(current.len().max(sdo.transfer_size()), 0);
            current
        };
        sdo.field.set(&mut data, value)?;
        let remain = deadline.saturating_duration_since(Instant::now());
        self.sdo_write(slave, sdo.index, sub, complete, &data, remain).await
    }

    fn record_emergencies(&mut self, slave: u16, emergencies: Vec<can::Emergency>) {
        for emergency in emergencies {
            self.diagnostics.push(Some(slave), Event::Emergency(emergency));
        }
    }
    fn record_can<T>(&mut self, slave: u16, index: u16, sub: u8, result: &EthercatResult<T, CanError>) {
        let event = match result {
            Ok(_) => return,
            Err(EthercatError::Slave(_, CanError::Sdo(code))) => Event::SdoAbort {index, sub, code: *code},
            Err(EthercatError::Slave(_, CanError::Mailbox(error))) => Event::Mailbox(*error),
            Err(EthercatError::Timeout(_)) => Event::MailboxTimeout {index, sub},
            Err(EthercatError::Protocol(message)) => Event::Packet {index, sub, message: *message},
            Err(_) => return,
        };
        self.diagnostics.push(Some(slave), event);
    }

    /// read elements of an IDN of a servo drive using SoE
    pub async fn soe_read(&mut self, slave: u16, drive: u8, elements: u8, idn: u16, timeout: Duration) -> EthercatResult<Vec<u8>, ServoError> {
        let position = self.index(slave)?;
        let supported = self.slaves[position].info.protocols.servo();
        let result = Servo::new(self.mailbox(position, supported)?)
            .read(drive, elements, idn, timeout).await;
        self.record_servo(slave, drive, idn, &result);
        result
    }
    /// write elements of an IDN of a servo drive using SoE
    pub async fn soe_write(&mut self, slave: u16, drive: u8, elements: u8, idn: u16, data: &[u8], timeout: Duration) -> EthercatResult<(), ServoError> {
        let position = self.index(slave)?;
        let supported = self.slaves[position].info.protocols.servo();
        let result = Servo::new(self.mailbox(position, supported)?)
            .write(drive, elements, idn, data, timeout).await;
        self.record_servo(slave, drive, idn, &result);
        result
    }
    fn record_servo<T>(&mut self, slave: u16, drive: u8, idn: u16, result: &EthercatResult<T, ServoError>) {
        let event = match result {
            Ok(_) => return,
            Err(EthercatError::Slave(_, ServoError::Idn(code))) => Event::SoeError {idn, code: *code},
            Err(EthercatError::Slave(_, ServoError::Mailbox(error))) => Event::Mailbox(*error),
            Err(EthercatError::Timeout(_)) => Event::MailboxTimeout {index: idn, sub: drive},
            Err(EthercatError::Protocol(message)) => Event::Packet {index: idn, sub: drive, message: *message},
            Err(_) => return,
        };
        self.diagnostics.push(Some(slave), event);
    }

    /**
        read the messages slaves of a group sent on their own (like CoE emergencies), no more than `limit`

        emergencies are recorded in diagnostics, other messages are dropped. Returns the number of messages read.
    */
    pub async fn poll_mailboxes(&mut self, group: u8, limit: usize) -> EthercatResult<usize> {
        self.check_configured()?;
        let mut handled = 0;
        for entry in self.slaves.iter_mut().filter(|entry| entry.info.group == group) {
            let station = entry.info.station;
            let Some(mailbox) = entry.mailbox.as_mut()  else {continue};
            while handled < limit {
                match mailbox.available().await {
                    Ok(true) => {},
                    Ok(false) => break,
                    Err(error) => {
                        debug!("slave {:#x}: cannot check mailbox: {}", station, error);
                        break;
                    },
                }
                match mailbox.read(self.config.mailbox_receive_timeout).await {
                    Ok((MailboxType::Can, frame)) => match can::emergency(&frame) {
                        Ok(Some(emergency)) => {
                            warn!("slave {:#x}: emergency {:#06x}", station, emergency.code);
                            self.diagnostics.push(Some(station), Event::Emergency(emergency));
                        },
                        Ok(None) => debug!("slave {:#x}: dropping unsolicited CoE frame", station),
                        Err(_) => self.diagnostics.push(Some(station), Event::Packet {index: 0, sub: 0, message: "malformed CoE frame"}),
                    },
                    Ok((ty, _)) => debug!("slave {:#x}: dropping unsolicited {:?} frame", station, ty),
                    Err(EthercatError::Slave(_, error)) => self.diagnostics.push(Some(station), Event::Mailbox(error)),
                    Err(error) => {
                        warn!("slave {:#x}: cannot read mailbox: {}", station, error);
                        break;
                    },
                }
                handled += 1;
            }
        }
        Ok(handled)
    }

    /// read `size` bytes of a slave's EEPROM starting at the given word
    pub async fn eeprom_read(&self, slave: u16, word: u16, size: usize, timeout: Duration) -> EthercatResult<Vec<u8>> {
        self.index(slave)?;
        Sii::new(&self.raw, slave, timeout).read_bytes(word, size).await
    }
    /// write bytes to a slave's EEPROM starting at the given word
    pub async fn eeprom_write(&self, slave: u16, word: u16, data: &[u8], timeout: Duration) -> EthercatResult {
        self.index(slave)?;
        Sii::new(&self.raw, slave, timeout).write_bytes(word, data).await
    }

    /// read physical memory of the slave at `position`, returns the working counter
    pub async fn aprd(&self, position: u16, memory: u16, data: &mut [u8], timeout: Duration) -> EthercatResult<u16> {
        self.raw_pdu(PduCommand::APRD, SlaveAddress::AutoIncremented(position), memory, data, timeout).await
    }
    /// write physical memory of the slave at `position`, returns the working counter
    pub async fn apwr(&self, position: u16, memory: u16, data: &[u8], timeout: Duration) -> EthercatResult<u16> {
        self.raw_pdu(PduCommand::APWR, SlaveAddress::AutoIncremented(position), memory, &mut data.to_vec(), timeout).await
    }
    /// read logical memory, returns the working counter
    pub async fn lrd(&self, logical: u32, data: &mut [u8], timeout: Duration) -> EthercatResult<u16> {
        self.raw_pdu(PduCommand::LRD, SlaveAddress::Logical(logical), 0, data, timeout).await
    }
    /// write logical memory, returns the working counter
    pub async fn lwr(&self, logical: u32, data: &[u8], timeout: Duration) -> EthercatResult<u16> {
        self.raw_pdu(PduCommand::LWR, SlaveAddress::Logical(logical), 0, &mut data.to_vec(), timeout).await
    }
    /// exchange logical memory, returns the working counter
    pub async fn lrw(&self, logical: u32, data: &mut [u8], timeout: Duration) -> EthercatResult<u16> {
        self.raw_pdu(PduCommand::LRW, SlaveAddress::Logical(logical), 0, data, timeout).await
    }
    async fn raw_pdu(&self, command: PduCommand, slave: SlaveAddress, memory: u16, data: &mut [u8], timeout: Duration) -> EthercatResult<u16> {
        self.check_open()?;
        let (slave_address, memory_address) = slave.split(usize::from(memory))?;
        self.raw.pdu(command, slave_address, memory_address, data, timeout).await
    }

    /**
        measure the propagation delays on the segment and synchronize the clocks of the DC slaves on the first of them

        returns true if any slave supports distributed clocks
    */
    pub async fn configure_dc(&mut self) -> EthercatResult<bool> {
        self.check_configured()?;
        let slaves = self.slaves.iter()
            .map(|entry| (entry.info.station, entry.info.dc, entry.status, entry.info.parent.map(usize::from)))
            .collect::<Vec<_>>();
        let (delays, reference) = clock::configure(&self.raw, &slaves).await?;
        for (entry, delay) in self.slaves.iter_mut().zip(delays) {
            entry.info.delay = delay;
        }
        self.reference = reference
            .and_then(|index| self.slaves.get(index))
            .map(|entry| entry.info.station);
        self.dc_configured = true;
        Ok(self.reference.is_some())
    }
    /// station address of the slave whose clock is the reference, if distributed clocks are configured
    pub fn reference_clock(&self) -> Option<u16> {self.reference}

    /**
        enable or disable the SYNC0 signal of a slave

        `cycle` and `shift` are in nanoseconds. The first pulse happens on a cycle boundary after [MasterConfig::sync_delay]
    */
    pub async fn configure_sync0(&self, slave: u16, enable: bool, cycle: u32, shift: i32) -> EthercatResult {
        self.check_dc(slave)?;
        clock::configure_sync0(&self.raw, slave, enable, cycle, shift, self.config.sync_delay).await
    }
    /**
        enable or disable the SYNC0 and SYNC1 signals of a slave

        SYNC1 pulses `cycle1` after each SYNC0 pulse, see [clock::sync1_period]
    */
    pub async fn configure_sync01(&self, slave: u16, enable: bool, cycle0: u32, cycle1: u32, shift: i32) -> EthercatResult {
        self.check_dc(slave)?;
        clock::configure_sync01(&self.raw, slave, enable, cycle0, cycle1, shift, self.config.sync_delay).await
    }
    fn check_dc(&self, slave: u16) -> EthercatResult {
        let index = self.index(slave)?;
        if ! self.slaves[index].info.dc
            {return Err(EthercatError::Master("slave does not support distributed clock"))}
        Ok(())
    }

    /// snapshot of every slave descriptor, in segment order
    pub fn slaves(&self) -> Vec<SlaveInfo> {
        self.slaves.iter().map(|entry| entry.info.clone()).collect()
    }
    /// descriptor of one slave
    pub fn slave(&self, slave: u16) -> EthercatResult<&SlaveInfo> {
        let index = self.index(slave)?;
        Ok(&self.slaves[index].info)
    }
    pub fn diagnostics(&self) -> Vec<Record> {self.diagnostics.records()}
    /// diagnostics rendered one record per line
    pub fn diagnostics_report(&self) -> String {self.diagnostics.report()}
    pub fn clear_diagnostics(&mut self) {self.diagnostics.clear()}

    /// the whole process image
    pub fn image(&self) -> &[u8] {&self.image}
    /// the part of the process image exchanged with a group
    pub fn group_image(&self, group: u8) -> EthercatResult<&[u8]> {
        let layout = self.layout.group(group)
            .ok_or(EthercatError::Master("no slave in this group"))?;
        self.image.get(layout.range.clone())
            .ok_or(EthercatError::Master("group is not mapped"))
    }
    /// outputs of a slave in the process image, sent at next exchange
    pub fn outputs(&mut self, slave: u16) -> EthercatResult<&mut [u8]> {
        let index = self.index(slave)?;
        let range = self.slaves[index].info.outputs.clone();
        self.image.get_mut(range)
            .ok_or(EthercatError::Master("slave is not mapped"))
    }
    /// inputs of a slave in the process image, as received at last exchange
    pub fn inputs(&self, slave: u16) -> EthercatResult<&[u8]> {
        let index = self.index(slave)?;
        self.image.get(self.slaves[index].info.inputs.clone())
            .ok_or(EthercatError::Master("slave is not mapped"))
    }
    /// working counter expected when exchanging a group
    pub fn expected_wc(&self, group: u8) -> EthercatResult<u16> {
        self.layout.group(group)
            .map(|layout| layout.expected_wc())
            .ok_or(EthercatError::Master("no slave in this group"))
    }
}
