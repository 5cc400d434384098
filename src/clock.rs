/*!
    Implementation of the distributed clock (DC) configuration between master and slaves.

    The first slave supporting DC is used as reference clock. Its system time is the time every other DC slave follows, compensated by:

    - the **propagation delay**: time a frame takes to go from the reference slave to the current slave, measured with the receive times latched on each port of each slave when a frame passes
    - the **system offset**: difference between the master time and the local time of the slave when the configuration is done

    Once the clocks are configured, the slaves can generate their SYNC0/SYNC1 signals at the same time, triggering their realtime tasks.

    All this is described in ETG.1000.4 + ETG.1000.6 and ETG.1020.21

    Continuous drift compensation is not done here, it belongs to the control loop using the clock.
*/

use core::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};
use log::{debug, info};

use crate::{
    rawmaster::RawMaster,
    registers::{self, DLStatus, SyncActivation},
    error::{EthercatError, EthercatResult},
    };


/// seconds between the unix epoch and the ethercat epoch (2000-01-01)
const ETHERCAT_EPOCH: u64 = 946_684_800;
/// port processing order of a slave
const PORT_ORDER: [usize; 4] = [0, 3, 1, 2];


/// nanoseconds since 2000-01-01, the origin of ethercat system time
pub fn master_time() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH)
        .map(|time| time.as_nanos() as u64)
        .unwrap_or(0)
        .saturating_sub(ETHERCAT_EPOCH * 1_000_000_000)
}

/**
    find the parent of each slave from the number of active ports of slaves before it

    slaves are given in topological order. A slave with one active port ends a branch, a slave with 3 or 4 active ports opens branches.
*/
pub fn parents(ports: &[DLStatus]) -> Vec<Option<usize>> {
    let active = ports.iter()
        .map(|status| status.ports().iter().filter(|&&port| port).count())
        .collect::<Vec<_>>();
    (0 .. ports.len()).map(|index| {
        let mut branches = 0i32;
        for candidate in (0 .. index).rev() {
            match active[candidate] {
                1 => branches -= 1,
                3 => branches += 1,
                4 => branches += 2,
                _ => {},
            }
            if (branches >= 0 && active[candidate] > 1) || candidate == 0
                {return Some(candidate)}
        }
        None
    }).collect()
}

/// receive times latched by a slave, input of the delay computation
#[derive(Copy, Clone, Debug, Default)]
pub struct PortTimes {
    pub dc: bool,
    pub parent: Option<usize>,
    pub active: [bool; 4],
    /// receive time on each port, 32 bits local time
    pub times: [u32; 4],
}
impl PortTimes {
    /// previous active port in the processing order
    fn previous(&self, port: usize) -> usize {
        let position = PORT_ORDER.iter().position(|&p| p == port).unwrap_or(0);
        (1 .. 4)
            .map(|shift| PORT_ORDER[(position + 4 - shift) % 4])
            .find(|&p| self.active[p])
            .unwrap_or(port)
    }
    /// time from `earlier` to `later` port receive times, the 32 bits local clock may wrap in between
    fn elapsed(&self, later: usize, earlier: usize) -> i64 {
        i64::from(self.times[later].wrapping_sub(self.times[earlier]) as i32)
    }
    fn count(&self) -> usize {self.active.iter().filter(|&&port| port).count()}
    /// the port the frame entered by is the one with the earliest time
    fn entry(&self) -> usize {
        let first = self.active.iter().position(|&active| active).unwrap_or(0);
        (0 .. 4)
            .filter(|&port| self.active[port])
            .min_by_key(|&port| self.elapsed(port, first))
            .unwrap_or(0)
    }
}

/**
    compute the propagation delay from the reference clock to every DC slave

    the delay of a slave is its parent's delay, plus half the loop time on the parent's port minus the loop time behind the slave, plus the loop time of the slave's previous siblings. Forward and return delays are assumed equal. Slaves without DC get no delay.
*/
pub fn delays(slaves: &[PortTimes]) -> Vec<Option<u32>> {
    let mut delays = vec![None; slaves.len()];
    let entries = slaves.iter().map(PortTimes::entry).collect::<Vec<_>>();
    // ports of each slave not yet associated to a child
    let mut free = slaves.iter().zip(&entries)
        .map(|(slave, &entry)| {
            let mut free = slave.active;
            free[entry] = false;
            free
        })
        .collect::<Vec<_>>();
    let mut reference = None;

    for index in 0 .. slaves.len() {
        let slave = &slaves[index];
        if ! slave.dc  {continue}
        if reference.is_none() {
            reference = Some(index);
            delays[index] = Some(0);
            continue;
        }
        // closest ancestor with a clock, and its child leading to this slave
        let mut child = index;
        let mut ancestor = slave.parent;
        while let Some(parent) = ancestor {
            if slaves[parent].dc  {break}
            child = parent;
            ancestor = slaves[parent].parent;
        }
        let Some(parent) = ancestor else {
            delays[index] = Some(0);
            continue;
        };
        let up = &slaves[parent];

        // port of the parent this slave is connected to
        let mut port = [3, 1, 2, 0].into_iter()
            .find(|&port| free[parent][port])
            .unwrap_or(0);
        free[parent][port] = false;
        if up.count() == 1
            {port = entries[parent]}

        // loop time behind the parent port
        let span = up.elapsed(port, up.previous(port));
        // loop time behind this slave
        let mut behind = 0;
        if slave.count() > 1
            {behind = slave.elapsed(slave.previous(entries[index]), entries[index])}
        if behind > span
            {behind = -behind}
        // loop time of previous siblings
        let mut siblings = 0;
        if child - parent > 1
            {siblings = up.elapsed(up.previous(port), entries[parent]).abs()}

        let parent_delay = i64::from(delays[parent].unwrap_or(0));
        let delay = (span - behind) / 2 + siblings + parent_delay;
        delays[index] = Some(delay.clamp(0, i64::from(u32::MAX)) as u32);
    }
    delays
}

/**
    measure and write the delays and offsets of every DC slave

    `slaves` gives the station address, DC support, DL status and parent of every slave in topological order. Returns the delays computed (None for slaves without DC) and the index of the reference slave if any.
*/
pub async fn configure(master: &RawMaster, slaves: &[(u16, bool, DLStatus, Option<usize>)]) -> EthercatResult<(Vec<Option<u32>>, Option<usize>)> {
    let reference = slaves.iter().position(|(_, dc, _, _)| *dc);
    let Some(reference) = reference else {
        info!("no slave supports distributed clock");
        return Ok((vec![None; slaves.len()], None));
    };

    // latch receive times on all ports of all slaves
    master.bwr(registers::dc::received_time_port0, 0u32).await?;
    let now = master_time();

    let mut times = Vec::with_capacity(slaves.len());
    let mut locals = Vec::with_capacity(slaves.len());
    for &(station, dc, status, parent) in slaves {
        let mut port = PortTimes {dc, parent, active: status.ports(), times: [0; 4]};
        let mut local = 0;
        if dc {
            let raw = master.fprd(station, registers::dc::received_time).await?.one()?;
            for (time, bytes) in port.times.iter_mut().zip(raw.chunks_exact(4)) {
                *time = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            }
            local = master.fprd(station, registers::dc::receive_time_unit).await?.one()?;
        }
        times.push(port);
        locals.push(local);
    }

    let delays = delays(&times);
    for ((&(station, _, _, _), delay), local) in slaves.iter().zip(&delays).zip(locals) {
        let Some(delay) = *delay  else {continue};
        let offset = now.wrapping_sub(local);
        debug!("slave {:#x}: clock delay {} ns, offset {} ns", station, delay, offset as i64);
        master.fpwr(station, registers::dc::system_offset, offset).await?.one()?;
        master.fpwr(station, registers::dc::system_delay, delay).await?.one()?;
    }
    info!("distributed clock reference is slave {:#x}", slaves[reference].0);
    Ok((delays, Some(reference)))
}

/// first sync pulse time: the next cycle boundary after the given delay, shifted
pub fn start_time(now: u64, delay: u64, cycle: u64, shift: i64) -> u64 {
    let boundary = ((now + delay) / cycle) * cycle + cycle;
    boundary.wrapping_add(shift as u64)
}

/// effective cycle time of the SYNC1 signal, a whole multiple of the SYNC0 cycle
pub fn sync1_period(cycle0: u32, cycle1: u32) -> u64 {
    (u64::from(cycle1) / u64::from(cycle0) + 1) * u64::from(cycle0)
}

/**
    configure the SYNC0 signal generation of a slave

    `cycle` and `shift` are in nanoseconds, the first pulse happens after `delay` on a cycle boundary
*/
pub async fn configure_sync0(master: &RawMaster, station: u16, enable: bool, cycle: u32, shift: i32, delay: Duration) -> EthercatResult {
    configure_sync(master, station, enable, cycle, None, shift, delay).await
}

/**
    configure the SYNC0 and SYNC1 signals generation of a slave

    SYNC1 is generated `cycle1` after each SYNC0 pulse, its actual period is a whole multiple of `cycle0`
*/
pub async fn configure_sync01(master: &RawMaster, station: u16, enable: bool, cycle0: u32, cycle1: u32, shift: i32, delay: Duration) -> EthercatResult {
    configure_sync(master, station, enable, cycle0, Some(cycle1), shift, delay).await
}

async fn configure_sync(master: &RawMaster, station: u16, enable: bool, cycle0: u32, cycle1: Option<u32>, shift: i32, delay: Duration) -> EthercatResult {
    master.fpwr(station, registers::dc::sync_activation, SyncActivation::OFF).await?.one()?;
    if ! enable
        {return Ok(())}
    if cycle0 == 0
        {return Err(EthercatError::Master("sync cycle time cannot be zero"))}

    // cycle unit controlled by ethercat
    master.fpwr(station, registers::dc::cycle_unit_control, 0u8).await?.one()?;
    let now = master.fprd(station, registers::dc::system_time).await?.one()?;
    let period = match cycle1 {
        Some(cycle1) => sync1_period(cycle0, cycle1),
        None => u64::from(cycle0),
    };
    let start = start_time(now, delay.as_nanos() as u64, period, i64::from(shift));
    debug!("slave {:#x}: sync start at {} ns, cycle {} ns", station, start, cycle0);
    master.fpwr(station, registers::dc::start_time, start).await?.one()?;
    master.fpwr(station, registers::dc::sync0_cycle, cycle0).await?.one()?;
    let activation = match cycle1 {
        Some(cycle1) => {
            master.fpwr(station, registers::dc::sync1_cycle, cycle1).await?.one()?;
            SyncActivation::SYNC01
        },
        None => SyncActivation::SYNC0,
    };
    master.fpwr(station, registers::dc::sync_activation, activation).await?.one()?;
    Ok(())
}
