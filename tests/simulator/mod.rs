//! in-memory ethercat segment, its slaves answer datagrams like real slaves would

#![allow(dead_code)]

use std::{
    collections::{BTreeMap, VecDeque},
    io,
    sync::{Arc, Mutex},
    task::{Context, Poll, Waker},
};
use ethercore::socket::EthercatSocket;


/// size of each slave's physical memory
pub const MEMORY: usize = 0x2000;
pub const MAILBOX_WRITE: u16 = 0x1000;
pub const MAILBOX_READ: u16 = 0x1080;
pub const MAILBOX_SIZE: u16 = 128;
pub const PROCESS_OUT: u16 = 0x1100;
pub const PROCESS_IN: u16 = 0x1180;
/// system time reported by every DC slave
pub const SYSTEM_TIME: u64 = 5_000_000_000;
/// error code sent for unknown IDNs
pub const SOE_NO_IDN: u16 = 0x1001;

const MAILBOX_HEADER: usize = 6;
const EEPROM_WORDS: usize = 0x200;

const AL_CONTROL: usize = 0x120;
const AL_STATUS: usize = 0x130;
const AL_CODE: usize = 0x134;
const SII_CONTROL: usize = 0x502;
const SII_ADDRESS: usize = 0x504;
const SII_DATA: usize = 0x508;
const RECEIVED_TIME: usize = 0x900;
const FULL: u8 = 0b1000;

fn sm(channel: usize, byte: usize) -> usize {0x800 + 8*channel + byte}
fn fmmu(index: usize) -> usize {0x600 + 16*index}


/// description of a simulated slave
#[derive(Clone, Debug)]
pub struct SlaveConfig {
    pub vendor: u32,
    pub product: u32,
    pub revision: u32,
    pub serial: u32,
    pub name: Option<String>,
    pub output_bytes: u16,
    pub input_bytes: u16,
    pub mailbox: bool,
    pub dc: bool,
    /// the slave copies its outputs to its inputs after each logical write
    pub echo: bool,
    /// the EEPROM never acknowledges reads
    pub broken_eeprom: bool,
    /// the EEPROM describes each PDO in its own category
    pub split_pdos: bool,
    pub objects: BTreeMap<(u16, u8), Vec<u8>>,
    pub idns: BTreeMap<u16, Vec<u8>>,
}
impl SlaveConfig {
    pub fn new(output_bytes: u16, input_bytes: u16) -> Self {
        Self {
            vendor: 0x0000_0abc,
            product: 0x0001_0000 + u32::from(output_bytes) * 0x100 + u32::from(input_bytes),
            revision: 0x0002,
            serial: 0x1234,
            name: Some(String::from("SIM-IO")),
            output_bytes,
            input_bytes,
            mailbox: true,
            dc: true,
            echo: false,
            broken_eeprom: false,
            split_pdos: false,
            objects: BTreeMap::new(),
            idns: BTreeMap::new(),
        }
    }
    pub fn echo(mut self) -> Self {self.echo = true; self}
    pub fn without_mailbox(mut self) -> Self {self.mailbox = false; self}
    pub fn without_dc(mut self) -> Self {self.dc = false; self}
    pub fn broken_eeprom(mut self) -> Self {self.broken_eeprom = true; self}
    pub fn unnamed(mut self) -> Self {self.name = None; self}
    pub fn split_pdos(mut self) -> Self {self.split_pdos = true; self}
    pub fn object(mut self, index: u16, sub: u8, data: &[u8]) -> Self {
        self.objects.insert((index, sub), data.to_vec());
        self
    }
    pub fn idn(mut self, idn: u16, data: &[u8]) -> Self {
        self.idns.insert(idn, data.to_vec());
        self
    }
}


/// the simulated segment, to be given to the master as socket
pub struct Segment {
    state: Mutex<State>,
}
struct State {
    slaves: Vec<SimSlave>,
    answers: VecDeque<Vec<u8>>,
    waker: Option<Waker>,
    /// frames are lost
    drop_all: bool,
    sent: usize,
}

impl Segment {
    pub fn new(slaves: Vec<SlaveConfig>) -> Arc<Self> {
        let count = slaves.len();
        let slaves = slaves.into_iter()
            .enumerate()
            .map(|(position, config)| SimSlave::new(config, position, count))
            .collect();
        Arc::new(Self {state: Mutex::new(State {
            slaves,
            answers: VecDeque::new(),
            waker: None,
            drop_all: false,
            sent: 0,
        })})
    }
    /// `n` identical slaves
    pub fn uniform(n: usize, config: SlaveConfig) -> Arc<Self> {
        Self::new(vec![config; n])
    }

    /// the slave at `position` stops processing datagrams, it only forwards them
    pub fn set_silent(&self, position: usize, silent: bool) {
        self.state.lock().unwrap().slaves[position].silent = silent;
    }
    /// every frame sent is lost
    pub fn set_drop_all(&self, drop: bool) {
        self.state.lock().unwrap().drop_all = drop;
    }
    /// number of frames sent by the master so far
    pub fn sent(&self) -> usize {
        self.state.lock().unwrap().sent
    }
    pub fn memory(&self, position: usize, address: u16, size: usize) -> Vec<u8> {
        let address = usize::from(address);
        self.state.lock().unwrap().slaves[position].memory[address .. address + size].to_vec()
    }
    /// write the physical memory of a slave, as its application would
    pub fn set_memory(&self, position: usize, address: u16, data: &[u8]) {
        let address = usize::from(address);
        self.state.lock().unwrap().slaves[position].memory[address .. address + data.len()].copy_from_slice(data);
    }
    pub fn memory_u32(&self, position: usize, address: u16) -> u32 {
        let data = self.memory(position, address, 4);
        u32::from_le_bytes([data[0], data[1], data[2], data[3]])
    }
    pub fn memory_u64(&self, position: usize, address: u16) -> u64 {
        let data = self.memory(position, address, 8);
        u64::from_le_bytes(data.try_into().unwrap())
    }
    /// AL state reported by a slave, without the error flag
    pub fn al_state(&self, position: usize) -> u8 {
        self.state.lock().unwrap().slaves[position].memory[AL_STATUS] & 0x0f
    }
    pub fn object(&self, position: usize, index: u16, sub: u8) -> Option<Vec<u8>> {
        self.state.lock().unwrap().slaves[position].objects.get(&(index, sub)).cloned()
    }
    pub fn idn(&self, position: usize, idn: u16) -> Option<Vec<u8>> {
        self.state.lock().unwrap().slaves[position].idns.get(&idn).cloned()
    }
    pub fn eeprom_word(&self, position: usize, word: usize) -> u16 {
        self.state.lock().unwrap().slaves[position].eeprom[word]
    }
    /// SDO abort codes sent by the master to a slave
    pub fn aborts(&self, position: usize) -> Vec<u32> {
        self.state.lock().unwrap().slaves[position].aborts.clone()
    }
    /// the slave restarts: its registers come back to their power-on values
    pub fn power_cycle(&self, position: usize) {
        self.state.lock().unwrap().slaves[position].reset();
    }
    /// another slave takes the place of the one at `position`
    pub fn replace(&self, position: usize, config: SlaveConfig) {
        let mut state = self.state.lock().unwrap();
        let count = state.slaves.len();
        state.slaves[position] = SimSlave::new(config, position, count);
    }
    /// the slave sends a CoE emergency on its own
    pub fn push_emergency(&self, position: usize, code: u16, register: u8) {
        let mut state = self.state.lock().unwrap();
        state.slaves[position].send(3, emergency(code, register));
    }
    pub fn set_upload_fault(&self, position: usize, fault: Option<UploadFault>) {
        self.state.lock().unwrap().slaves[position].upload_fault = fault;
    }
    /// the slave keeps sending emergencies, any other frame waits behind the current one
    pub fn set_flood(&self, position: usize, flood: bool) {
        let mut state = self.state.lock().unwrap();
        let slave = &mut state.slaves[position];
        slave.flood = flood;
        slave.load_mailbox();
    }
}

impl EthercatSocket for Segment {
    fn poll_receive(&self, cx: &mut Context<'_>, data: &mut [u8]) -> Poll<io::Result<usize>> {
        let mut state = self.state.lock().unwrap();
        match state.answers.pop_front() {
            Some(frame) => {
                data[.. frame.len()].copy_from_slice(&frame);
                Poll::Ready(Ok(frame.len()))
            },
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            },
        }
    }
    fn poll_send(&self, _cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<()>> {
        let mut state = self.state.lock().unwrap();
        state.sent += 1;
        if ! state.drop_all {
            let answer = state.process(data);
            state.answers.push_back(answer);
            if let Some(waker) = state.waker.take() {
                waker.wake();
            }
        }
        Poll::Ready(Ok(()))
    }
    fn max_frame(&self) -> usize {1500}
}

/// a socket whose link is down
pub struct BrokenSocket;
impl EthercatSocket for BrokenSocket {
    fn poll_receive(&self, _cx: &mut Context<'_>, _data: &mut [u8]) -> Poll<io::Result<usize>> {
        Poll::Pending
    }
    fn poll_send(&self, _cx: &mut Context<'_>, _data: &[u8]) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::NotConnected, "link down")))
    }
    fn max_frame(&self) -> usize {1500}
}


impl State {
    /// pass a frame through every slave, returning the frame coming back
    fn process(&mut self, frame: &[u8]) -> Vec<u8> {
        let mut frame = frame.to_vec();
        let header = u16::from_le_bytes([frame[0], frame[1]]);
        let end = 2 + usize::from(header & 0x7ff);
        let mut offset = 2;
        while offset + 12 <= end {
            let command = frame[offset];
            let mut adp = u16::from_le_bytes([frame[offset+2], frame[offset+3]]);
            let ado = u16::from_le_bytes([frame[offset+4], frame[offset+5]]);
            let flags = u16::from_le_bytes([frame[offset+6], frame[offset+7]]);
            let size = usize::from(flags & 0x7ff);
            let start = offset + 10;
            let mut data = frame[start .. start + size].to_vec();
            let mut wc = u16::from_le_bytes([frame[start + size], frame[start + size + 1]]);
            for slave in &mut self.slaves {
                wc += slave.datagram(command, &mut adp, ado, &mut data);
            }
            frame[offset+2 .. offset+4].copy_from_slice(&adp.to_le_bytes());
            frame[start .. start + size].copy_from_slice(&data);
            frame[start + size .. start + size + 2].copy_from_slice(&wc.to_le_bytes());
            offset = start + size + 2;
            if flags & 0x8000 == 0 {break}
        }
        frame
    }
}


#[derive(Copy, Clone, Eq, PartialEq)]
enum Access {Read, Write, ReadWrite}

/// misbehaviour of a slave during segmented SDO uploads, counting segments from 0
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UploadFault {
    /// no answer to segment requests from this segment on
    Stall(usize),
    /// this segment is sent with the wrong toggle bit
    BadToggle(usize),
}

struct Upload {
    index: u16,
    sub: u8,
    data: Vec<u8>,
    sent: usize,
    toggle: bool,
    segments: usize,
}
struct Download {
    index: u16,
    sub: u8,
    total: usize,
    data: Vec<u8>,
    toggle: bool,
}

struct SimSlave {
    config: SlaveConfig,
    position: usize,
    count: usize,
    memory: Vec<u8>,
    eeprom: Vec<u16>,
    objects: BTreeMap<(u16, u8), Vec<u8>>,
    idns: BTreeMap<u16, Vec<u8>>,
    silent: bool,
    /// mailbox frames waiting for the read buffer to be free
    outbox: VecDeque<Vec<u8>>,
    /// last frame put in the read buffer, for repeat requests
    last: Option<Vec<u8>>,
    counter: u8,
    upload: Option<Upload>,
    download: Option<Download>,
    fragments: Vec<u8>,
    aborts: Vec<u32>,
    upload_fault: Option<UploadFault>,
    /// the read mailbox is refilled with an emergency as soon as it is empty
    flood: bool,
}

impl SimSlave {
    fn new(config: SlaveConfig, position: usize, count: usize) -> Self {
        let mut objects = config.objects.clone();
        objects.insert((0x1000, 0), 0x0000_1389u32.to_le_bytes().to_vec());
        objects.insert((0x1018, 0), vec![4]);
        objects.insert((0x1018, 1), config.vendor.to_le_bytes().to_vec());
        objects.insert((0x1018, 2), config.product.to_le_bytes().to_vec());
        objects.insert((0x1018, 3), config.revision.to_le_bytes().to_vec());
        objects.insert((0x1018, 4), config.serial.to_le_bytes().to_vec());
        let mut slave = Self {
            eeprom: eeprom(&config),
            idns: config.idns.clone(),
            objects,
            config,
            position,
            count,
            memory: Vec::new(),
            silent: false,
            outbox: VecDeque::new(),
            last: None,
            counter: 0,
            upload: None,
            download: None,
            fragments: Vec::new(),
            aborts: Vec::new(),
            upload_fault: None,
            flood: false,
        };
        slave.reset();
        slave
    }

    /// power-on values of the registers
    fn reset(&mut self) {
        self.memory = vec![0; MEMORY];
        self.memory[0x0008] = if self.config.dc {0b100} else {0};
        let ports = [true, self.position + 1 < self.count, false, false];
        let mut status = 0u16;
        for (port, active) in ports.iter().enumerate() {
            if *active {status |= (1 << (4 + port)) | (1 << (9 + 2*port))}
            else {status |= 1 << (8 + 2*port)}
        }
        self.memory[0x110 .. 0x112].copy_from_slice(&status.to_le_bytes());
        self.memory[AL_STATUS] = 1;
        self.memory[0x910 .. 0x918].copy_from_slice(&SYSTEM_TIME.to_le_bytes());
        self.outbox.clear();
        self.last = None;
        self.upload = None;
        self.download = None;
        self.fragments.clear();
    }

    fn station(&self) -> u16 {u16::from_le_bytes([self.memory[0x10], self.memory[0x11]])}
    fn u16_at(&self, address: usize) -> u16 {u16::from_le_bytes([self.memory[address], self.memory[address+1]])}
    fn u32_at(&self, address: usize) -> u32 {
        u32::from_le_bytes([self.memory[address], self.memory[address+1], self.memory[address+2], self.memory[address+3]])
    }
    fn enabled(&self, channel: usize) -> bool {self.memory[sm(channel, 6)] & 1 != 0}

    /// process one datagram, returns the working counter increment
    fn datagram(&mut self, command: u8, adp: &mut u16, ado: u16, data: &mut [u8]) -> u16 {
        let address = usize::from(ado);
        match command {
            // auto increment
            0x01 ..= 0x03 => {
                let addressed = *adp == 0;
                *adp = adp.wrapping_add(1);
                if ! addressed || self.silent {return 0}
                self.physical(access(command - 0x01), address, data, false)
            },
            // fixed
            0x04 ..= 0x06 => {
                if self.silent || *adp != self.station() {return 0}
                self.physical(access(command - 0x04), address, data, false)
            },
            // broadcast
            0x07 ..= 0x09 => {
                if self.silent {return 0}
                self.physical(access(command - 0x07), address, data, true)
            },
            // logical
            0x0a ..= 0x0c => {
                if self.silent {return 0}
                let logical = u32::from(*adp) | (u32::from(ado) << 16);
                self.logical(access(command - 0x0a), logical, data)
            },
            _ => 0,
        }
    }

    fn physical(&mut self, access: Access, address: usize, data: &mut [u8], broadcast: bool) -> u16 {
        if address + data.len() > MEMORY {return 0}
        match access {
            Access::Read => {self.read(address, data, broadcast); 1},
            Access::Write => {self.write(address, data); 1},
            Access::ReadWrite => {
                let written = data.to_vec();
                self.read(address, data, broadcast);
                self.write(address, &written);
                3
            },
        }
    }

    fn read(&mut self, address: usize, data: &mut [u8], broadcast: bool) {
        for (i, byte) in data.iter_mut().enumerate() {
            if broadcast {*byte |= self.memory[address + i]}
            else {*byte = self.memory[address + i]}
        }
        // the master emptied the mailbox read buffer
        let last = usize::from(MAILBOX_READ + MAILBOX_SIZE) - 1;
        if self.config.mailbox && address <= last && last < address + data.len() {
            if self.memory[sm(1, 5)] & FULL != 0 {
                self.memory[sm(1, 5)] &= ! FULL;
                self.load_mailbox();
            }
        }
    }

    fn write(&mut self, address: usize, data: &[u8]) {
        let range = address .. address + data.len();
        for (i, byte) in data.iter().enumerate() {
            let target = address + i;
            // status and PDI control of sync managers belong to the slave
            if (0x800 .. 0x880).contains(&target) && matches!((target - 0x800) % 8, 5 | 7) {continue}
            self.memory[target] = *byte;
        }
        if range.contains(&AL_CONTROL) {self.al_control()}
        if range.contains(&SII_CONTROL) {self.sii_command()}
        if range.contains(&RECEIVED_TIME) {self.latch()}
        if range.contains(&sm(1, 6)) {
            if ! self.enabled(1) {
                self.memory[sm(1, 5)] = 0;
                self.outbox.clear();
            }
            self.repeat();
        }
        let last = usize::from(MAILBOX_WRITE + MAILBOX_SIZE) - 1;
        if self.config.mailbox && self.enabled(0) && range.contains(&last) {
            self.mailbox_request();
        }
    }

    fn logical(&mut self, access: Access, logical: u32, data: &mut [u8]) -> u16 {
        let (mut read, mut written) = (false, false);
        let frame = u64::from(logical) .. u64::from(logical) + data.len() as u64;
        for index in 0 .. 2 {
            let base = fmmu(index);
            if self.memory[base + 12] & 1 == 0 {continue}
            let start = u64::from(self.u32_at(base));
            let length = u64::from(self.u16_at(base + 4));
            let physical = usize::from(self.u16_at(base + 8));
            let (is_read, is_write) = (self.memory[base + 11] & 1 != 0, self.memory[base + 11] & 2 != 0);
            let from = start.max(frame.start);
            let to = (start + length).min(frame.end);
            if from >= to {continue}
            for offset in from .. to {
                let byte = (offset - frame.start) as usize;
                let memory = physical + (offset - start) as usize;
                if is_read && access != Access::Write {
                    data[byte] = self.memory[memory];
                    read = true;
                }
                if is_write && access != Access::Read {
                    self.memory[memory] = data[byte];
                    written = true;
                }
            }
        }
        if written && self.config.echo {
            let size = usize::from(self.config.output_bytes.min(self.config.input_bytes));
            let (outputs, inputs) = (usize::from(PROCESS_OUT), usize::from(PROCESS_IN));
            self.memory.copy_within(outputs .. outputs + size, inputs);
        }
        match access {
            Access::ReadWrite => u16::from(read) + 2*u16::from(written),
            _ => u16::from(read || written),
        }
    }

    fn al_control(&mut self) {
        let control = self.u16_at(AL_CONTROL);
        let requested = (control & 0x0f) as u8;
        let ack = control & 0x10 != 0;
        let current = self.memory[AL_STATUS] & 0x0f;
        let error = self.memory[AL_STATUS] & 0x10 != 0;
        if error && ! ack {return}
        match self.transition(current, requested) {
            Ok(state) => {
                self.memory[AL_STATUS] = state;
                self.memory[AL_CODE .. AL_CODE+2].copy_from_slice(&0u16.to_le_bytes());
            },
            Err(code) => {
                self.memory[AL_STATUS] = current | 0x10;
                self.memory[AL_CODE .. AL_CODE+2].copy_from_slice(&code.to_le_bytes());
            },
        }
    }
    fn transition(&mut self, current: u8, requested: u8) -> Result<u8, u16> {
        match requested {
            1 => {
                self.upload = None;
                self.download = None;
                Ok(1)
            },
            2 => {
                if self.config.mailbox && ! (self.enabled(0) && self.enabled(1))
                    {return Err(0x16)}
                Ok(2)
            },
            3 => Err(0x13),
            4 => {
                if current == 1 {return Err(0x11)}
                if self.config.output_bytes != 0 && ! (self.enabled(2) && self.memory[fmmu(0) + 12] & 1 != 0)
                    {return Err(0x1d)}
                if self.config.input_bytes != 0 && ! (self.enabled(3) && self.memory[fmmu(1) + 12] & 1 != 0)
                    {return Err(0x1e)}
                Ok(4)
            },
            8 => {
                if current != 4 && current != 8 {return Err(0x11)}
                Ok(8)
            },
            _ => Err(0x12),
        }
    }

    fn sii_command(&mut self) {
        let control = self.u16_at(SII_CONTROL);
        let address = self.u32_at(SII_ADDRESS) as usize;
        let mut status = 0u16;
        if control & 0x0100 != 0 {
            if self.config.broken_eeprom {
                status = 1 << 13;
            }
            else {
                for k in 0 .. 2 {
                    let word = self.eeprom.get(address + k).copied().unwrap_or(0xffff);
                    self.memory[SII_DATA + 2*k .. SII_DATA + 2*k + 2].copy_from_slice(&word.to_le_bytes());
                }
            }
        }
        else if control & 0x0200 != 0 {
            let value = self.u16_at(SII_DATA);
            match self.eeprom.get_mut(address) {
                Some(word) => *word = value,
                None => status = 1 << 14,
            }
        }
        self.memory[SII_CONTROL .. SII_CONTROL+2].copy_from_slice(&status.to_le_bytes());
    }

    /// latch the times the frame passes on each port, 100 ns between neighbours
    fn latch(&mut self) {
        if ! self.config.dc {return}
        let last = self.count as u32 - 1;
        let position = self.position as u32;
        let port0 = position * 100;
        let port1 = if position < last {(2*last - position) * 100} else {0};
        for (port, time) in [port0, port1, 0, 0].into_iter().enumerate() {
            self.memory[RECEIVED_TIME + 4*port .. RECEIVED_TIME + 4*port + 4].copy_from_slice(&time.to_le_bytes());
        }
        let local = 1_000_000 + u64::from(port0);
        self.memory[0x918 .. 0x920].copy_from_slice(&local.to_le_bytes());
    }

    /// acknowledge a repeat request by putting the last frame back in the read buffer
    fn repeat(&mut self) {
        let requested = self.memory[sm(1, 6)] & 0b10 != 0;
        let acknowledged = self.memory[sm(1, 7)] & 0b10 != 0;
        if requested == acknowledged {return}
        self.memory[sm(1, 7)] ^= 0b10;
        if let Some(frame) = self.last.clone() {
            self.fill(&frame);
        }
    }

    fn fill(&mut self, frame: &[u8]) {
        let start = usize::from(MAILBOX_READ);
        let buffer = &mut self.memory[start .. start + usize::from(MAILBOX_SIZE)];
        buffer.fill(0);
        buffer[.. frame.len()].copy_from_slice(frame);
        self.memory[sm(1, 5)] |= FULL;
    }
    fn load_mailbox(&mut self) {
        if self.memory[sm(1, 5)] & FULL != 0 {return}
        if self.flood && self.outbox.is_empty() {
            let frame = self.frame(3, emergency(0xff00, 0));
            self.outbox.push_back(frame);
        }
        if let Some(frame) = self.outbox.pop_front() {
            self.fill(&frame);
            self.last = Some(frame);
        }
    }
    /// queue a mailbox frame of the given type
    fn send(&mut self, ty: u8, content: Vec<u8>) {
        let frame = self.frame(ty, content);
        self.outbox.push_back(frame);
        self.load_mailbox();
    }
    fn frame(&mut self, ty: u8, content: Vec<u8>) -> Vec<u8> {
        self.counter = self.counter % 7 + 1;
        let mut frame = Vec::with_capacity(MAILBOX_HEADER + content.len());
        frame.extend_from_slice(&(content.len() as u16).to_le_bytes());
        frame.extend_from_slice(&0u16.to_le_bytes());
        frame.push(0);
        frame.push(ty | (self.counter << 4));
        frame.extend_from_slice(&content);
        frame
    }

    fn mailbox_request(&mut self) {
        let start = usize::from(MAILBOX_WRITE);
        let length = usize::from(self.u16_at(start));
        let ty = self.memory[start + 5] & 0x0f;
        let content = self.memory[start + MAILBOX_HEADER .. start + MAILBOX_HEADER + length].to_vec();
        match ty {
            3 => self.coe(&content),
            5 => self.soe(&content),
            // unsupported protocol
            _ => self.send(0, vec![0x01, 0x00, 0x02, 0x00]),
        }
    }

    fn coe(&mut self, content: &[u8]) {
        if content.len() < 3 || content[1] >> 4 != 2 {return}
        let command = content[2] >> 5;
        if command == 0 || command == 3 {
            match command {
                0 => self.download_segment(content),
                _ => self.upload_segment(content[2]),
            }
            return;
        }
        let index = u16::from_le_bytes([content[3], content[4]]);
        let sub = content[5];
        match command {
            1 => self.download(content, index, sub),
            2 => self.upload(index, sub, content[2] & 0x10 != 0),
            4 => {
                self.aborts.push(u32::from_le_bytes([content[6], content[7], content[8], content[9]]));
                self.upload = None;
                self.download = None;
            },
            _ => self.sdo_abort(index, sub, 0x0504_0001),
        }
    }
    fn sdo_response(&mut self, header: u8, index: u16, sub: u8, rest: &[u8]) {
        let mut content = vec![0x00, 0x30, header];
        content.extend_from_slice(&index.to_le_bytes());
        content.push(sub);
        content.extend_from_slice(rest);
        self.send(3, content);
    }
    fn sdo_abort(&mut self, index: u16, sub: u8, code: u32) {
        let mut content = vec![0x00, 0x20, 4 << 5];
        content.extend_from_slice(&index.to_le_bytes());
        content.push(sub);
        content.extend_from_slice(&code.to_le_bytes());
        self.send(3, content);
    }

    fn upload(&mut self, index: u16, sub: u8, complete: bool) {
        let data = if complete {
            let items = self.objects.range((index, sub) ..= (index, u8::MAX))
                .flat_map(|(_, data)| data.iter().copied())
                .collect::<Vec<_>>();
            if items.is_empty() {None} else {Some(items)}
        }
        else {self.objects.get(&(index, sub)).cloned()};
        let Some(data) = data else {
            let known = self.objects.keys().any(|(i, _)| *i == index);
            return self.sdo_abort(index, sub, if known {0x0609_0011} else {0x0602_0000});
        };
        if data.len() <= 4 && ! complete {
            let mut rest = data.clone();
            rest.resize(4, 0);
            let header = 0x43 | (((4 - data.len()) as u8) << 2);
            return self.sdo_response(header, index, sub, &rest);
        }
        let first = data.len().min(usize::from(MAILBOX_SIZE) - MAILBOX_HEADER - 10);
        let mut rest = (data.len() as u32).to_le_bytes().to_vec();
        rest.extend_from_slice(&data[.. first]);
        let header = 0x41 | if complete {0x10} else {0};
        self.sdo_response(header, index, sub, &rest);
        if first < data.len() {
            self.upload = Some(Upload {index, sub, data, sent: first, toggle: false, segments: 0});
        }
    }
    fn upload_segment(&mut self, header: u8) {
        let toggle = header & 0x10 != 0;
        let fault = self.upload_fault;
        let Some(upload) = self.upload.as_mut() else {
            return self.sdo_abort(0, 0, 0x0504_0001);
        };
        if toggle != upload.toggle {
            let (index, sub) = (upload.index, upload.sub);
            self.upload = None;
            return self.sdo_abort(index, sub, 0x0503_0000);
        }
        let chunk = (upload.data.len() - upload.sent).min(usize::from(MAILBOX_SIZE) - MAILBOX_HEADER - 3);
        let last = upload.sent + chunk == upload.data.len();
        let mut segment = upload.data[upload.sent .. upload.sent + chunk].to_vec();
        let padding = 7usize.saturating_sub(chunk);
        segment.resize(chunk + padding, 0);
        if fault == Some(UploadFault::Stall(upload.segments)) {return}
        let sent_toggle = if fault == Some(UploadFault::BadToggle(upload.segments)) {! toggle} else {toggle};
        upload.sent += chunk;
        upload.toggle = ! toggle;
        upload.segments += 1;
        if last {self.upload = None}

        let mut content = vec![0x00, 0x30, u8::from(last) | ((padding as u8) << 1) | (u8::from(sent_toggle) << 4)];
        content.extend_from_slice(&segment);
        self.send(3, content);
    }
    fn download(&mut self, content: &[u8], index: u16, sub: u8) {
        let header = content[2];
        if ! self.objects.keys().any(|(i, _)| *i == index) {
            return self.sdo_abort(index, sub, 0x0602_0000);
        }
        if header & 0x02 != 0 {
            let size = if header & 0x01 != 0 {4 - usize::from((header >> 2) & 0b11)} else {4};
            self.objects.insert((index, sub), content[6 .. 6 + size].to_vec());
        }
        else {
            let total = u32::from_le_bytes([content[6], content[7], content[8], content[9]]) as usize;
            let data = content[10 ..].to_vec();
            if data.len() >= total {
                self.objects.insert((index, sub), data[.. total].to_vec());
            }
            else {
                self.download = Some(Download {index, sub, total, data, toggle: false});
            }
        }
        self.sdo_response(0x60, index, sub, &[0; 4]);
    }
    fn download_segment(&mut self, content: &[u8]) {
        let header = content[2];
        let toggle = header & 0x10 != 0;
        let Some(download) = self.download.as_mut() else {
            return self.sdo_abort(0, 0, 0x0504_0001);
        };
        if toggle != download.toggle {
            let (index, sub) = (download.index, download.sub);
            self.download = None;
            return self.sdo_abort(index, sub, 0x0503_0000);
        }
        let payload = &content[3 ..];
        let size = if payload.len() == 7 {7 - usize::from((header >> 1) & 0b111)} else {payload.len()};
        download.data.extend_from_slice(&payload[.. size]);
        download.toggle = ! toggle;
        if header & 1 != 0 {
            let download = self.download.take().unwrap();
            if download.data.len() != download.total {
                return self.sdo_abort(download.index, download.sub, 0x0607_0010);
            }
            self.objects.insert((download.index, download.sub), download.data);
        }
        self.send(3, vec![0x00, 0x30, (u8::from(toggle) << 4) | (1 << 5)]);
    }

    fn soe(&mut self, content: &[u8]) {
        if content.len() < 4 {return}
        let header = u32::from_le_bytes([content[0], content[1], content[2], content[3]]);
        let opcode = header & 0b111;
        let incomplete = header & 0b1000 != 0;
        let drive = (header >> 5) & 0b111;
        let elements = (header >> 8) & 0xff;
        let idn = (header >> 16) as u16;
        let soe_header = |opcode: u32, incomplete: bool, error: bool, idn: u16| -> [u8; 4] {
            (opcode
                | (u32::from(incomplete) << 3)
                | (u32::from(error) << 4)
                | (drive << 5)
                | (elements << 8)
                | (u32::from(idn) << 16)
                ).to_le_bytes()
        };
        match opcode {
            // read
            1 => match self.idns.get(&idn).cloned() {
                Some(data) => {
                    let capacity = usize::from(MAILBOX_SIZE) - MAILBOX_HEADER - 4;
                    let chunks = data.chunks(capacity).collect::<Vec<_>>();
                    if chunks.is_empty() {
                        self.send(5, soe_header(2, false, false, idn).to_vec());
                    }
                    for (i, chunk) in chunks.iter().enumerate() {
                        let left = chunks.len() - i - 1;
                        let mut frame = soe_header(2, left != 0, false, if left != 0 {left as u16} else {idn}).to_vec();
                        frame.extend_from_slice(chunk);
                        self.send(5, frame);
                    }
                },
                None => {
                    let mut frame = soe_header(2, false, true, idn).to_vec();
                    frame.extend_from_slice(&SOE_NO_IDN.to_le_bytes());
                    self.send(5, frame);
                },
            },
            // write
            3 => {
                self.fragments.extend_from_slice(&content[4 ..]);
                if ! incomplete {
                    let data = core::mem::take(&mut self.fragments);
                    self.idns.insert(idn, data);
                    self.send(5, soe_header(4, false, false, idn).to_vec());
                }
            },
            _ => {},
        }
    }
}

/// content of a CoE emergency frame
fn emergency(code: u16, register: u8) -> Vec<u8> {
    let mut content = vec![0x00, 0x10];
    content.extend_from_slice(&code.to_le_bytes());
    content.push(register);
    content.extend_from_slice(&[1, 2, 3, 4, 5]);
    content
}

fn access(offset: u8) -> Access {
    match offset {
        0 => Access::Read,
        1 => Access::Write,
        _ => Access::ReadWrite,
    }
}

/// EEPROM content describing a slave
fn eeprom(config: &SlaveConfig) -> Vec<u16> {
    let mut words = vec![0u16; EEPROM_WORDS];
    let put32 = |words: &mut Vec<u16>, word: usize, value: u32| {
        words[word] = value as u16;
        words[word+1] = (value >> 16) as u16;
    };
    put32(&mut words, 0x08, config.vendor);
    put32(&mut words, 0x0a, config.product);
    put32(&mut words, 0x0c, config.revision);
    put32(&mut words, 0x0e, config.serial);
    if config.mailbox {
        words[0x18] = MAILBOX_WRITE;
        words[0x19] = MAILBOX_SIZE;
        words[0x1a] = MAILBOX_READ;
        words[0x1b] = MAILBOX_SIZE;
        // CoE and SoE
        words[0x1c] = 0b1_0100;
    }

    let mut categories = Vec::<u8>::new();
    let mut category = |ty: u16, mut data: Vec<u8>| {
        if data.len() % 2 != 0 {data.push(0)}
        categories.extend_from_slice(&ty.to_le_bytes());
        categories.extend_from_slice(&((data.len() / 2) as u16).to_le_bytes());
        categories.extend_from_slice(&data);
    };
    if let Some(name) = &config.name {
        let mut strings = vec![1, name.len() as u8];
        strings.extend_from_slice(name.as_bytes());
        category(10, strings);
        let mut general = vec![0; 32];
        general[3] = 1;
        category(30, general);
    }
    let mut sync_managers = Vec::new();
    let channels = [
        (MAILBOX_WRITE, if config.mailbox {MAILBOX_SIZE} else {0}, 0x26, if config.mailbox {1} else {0}),
        (MAILBOX_READ, if config.mailbox {MAILBOX_SIZE} else {0}, 0x22, if config.mailbox {2} else {0}),
        (PROCESS_OUT, config.output_bytes, 0x64, 3),
        (PROCESS_IN, config.input_bytes, 0x20, 4),
        ];
    for (address, length, control, usage) in channels {
        sync_managers.extend_from_slice(&address.to_le_bytes());
        sync_managers.extend_from_slice(&length.to_le_bytes());
        sync_managers.extend_from_slice(&[control, 0, u8::from(length != 0), usage]);
    }
    category(41, sync_managers);
    for (ty, index, channel, bytes) in [(51, 0x1600u16, 2, config.output_bytes), (50, 0x1a00, 3, config.input_bytes)] {
        if bytes == 0 {continue}
        // one byte entry per byte of process data, in one PDO or one PDO per entry
        let pdos = if config.split_pdos {vec![1; usize::from(bytes)]} else {vec![bytes]};
        for (i, entries) in pdos.into_iter().enumerate() {
            let pdo_index = index + i as u16;
            let mut pdo = Vec::new();
            pdo.extend_from_slice(&pdo_index.to_le_bytes());
            pdo.extend_from_slice(&[entries as u8, channel, 0, 0, 0, 0]);
            for sub in 0 .. entries {
                pdo.extend_from_slice(&(0x6000u16 + pdo_index - 0x1600).to_le_bytes());
                pdo.extend_from_slice(&[sub as u8 + 1, 0, 0, 8, 0, 0]);
            }
            category(ty, pdo);
        }
    }
    category(0xffff, Vec::new());

    for (i, pair) in categories.chunks(2).enumerate() {
        words[0x40 + i] = u16::from_le_bytes([pair[0], pair.get(1).copied().unwrap_or(0)]);
    }
    words
}
