/*!
    This module computes the layout of the process image: the place of every slave's process data in the contiguous logical memory exchanged with the segment, and programs the slaves accordingly.

    The image is made of the synchronization groups one after the other in ascending group id. Each group holds the outputs of all its slaves, then the inputs of all its slaves. Logical addresses equal image offsets, so a group's logical address range is its image range.

    ```text
    | group 0                         | group 1          |
    | out 1 | out 2 | in 1  | in 2    | out 3 | in 3     |
    ```

    A group bigger than one datagram is exchanged with consecutive LRW datagrams, each with its own expected working counter.
*/

use core::ops::Range;
use std::collections::BTreeMap;
use bilge::prelude::*;
use log::debug;

use crate::{
    rawmaster::RawMaster,
    registers::{self, FmmuEntry, SyncManagerChannel, SyncMode, SyncDirection},
    eeprom::{CategorySyncManager, SyncManagerUsage},
    error::{EthercatError, EthercatResult},
    };


/// working counter increment of a slave reading its outputs from a LRW datagram
const OUTPUT_WC: u16 = 2;
/// working counter increment of a slave writing its inputs into a LRW datagram
const INPUT_WC: u16 = 1;


/// process data sizes declared by a slave, input of the layout
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ProcessData {
    /// station address of the slave
    pub station: u16,
    pub group: u8,
    pub output_bits: u32,
    pub input_bits: u32,
}
impl ProcessData {
    pub fn output_bytes(&self) -> usize {bytes(self.output_bits)}
    pub fn input_bytes(&self) -> usize {bytes(self.input_bits)}
}

/// round a bit size up to whole bytes
pub fn bytes(bits: u32) -> usize {
    (bits as usize + 7) / 8
}

/// place of a slave's process data in the image
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SlaveRegion {
    pub outputs: Range<usize>,
    pub inputs: Range<usize>,
}

/// one LRW datagram exchanging a part of a group
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Datagram {
    /// image range, also logical range
    pub range: Range<usize>,
    /// working counter expected when every slave crossed processes the datagram
    pub expected: u16,
}

/// layout of a synchronization group
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GroupLayout {
    pub id: u8,
    /// image range, also logical range
    pub range: Range<usize>,
    /// slaves of the group in ascending station address
    pub slaves: Vec<(u16, SlaveRegion)>,
    pub datagrams: Vec<Datagram>,
}
impl GroupLayout {
    /// working counter expected for the whole group, summed over its datagrams
    pub fn expected_wc(&self) -> u16 {
        self.datagrams.iter()
            .fold(0u16, |total, datagram| total.saturating_add(datagram.expected))
    }
}

/// layout of the whole process image
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Layout {
    /// total size of the image in bytes
    pub size: usize,
    /// groups in ascending id
    pub groups: Vec<GroupLayout>,
}
impl Layout {
    /**
        compute the layout for the given slaves

        `max_datagram` is the maximum data size of one LRW datagram, `capacity` the maximum image size. The result only depends on the slaves sizes and memberships, so computing it again with the same slaves gives the same layout.
    */
    pub fn compute(slaves: &[ProcessData], max_datagram: usize, capacity: usize) -> EthercatResult<Self> {
        if max_datagram == 0
            {return Err(EthercatError::Master("datagrams cannot carry process data"))}
        let mut members = BTreeMap::<u8, Vec<&ProcessData>>::new();
        for slave in slaves {
            members.entry(slave.group).or_default().push(slave);
        }

        let mut offset = 0;
        let mut groups = Vec::with_capacity(members.len());
        for (id, mut slaves) in members {
            slaves.sort_by_key(|slave| slave.station);
            let start = offset;
            let mut regions = slaves.iter()
                .map(|slave| (slave.station, SlaveRegion::default()))
                .collect::<Vec<_>>();
            for (slave, (_, region)) in slaves.iter().zip(regions.iter_mut()) {
                region.outputs = offset .. offset + slave.output_bytes();
                offset = region.outputs.end;
            }
            for (slave, (_, region)) in slaves.iter().zip(regions.iter_mut()) {
                region.inputs = offset .. offset + slave.input_bytes();
                offset = region.inputs.end;
            }
            let range = start .. offset;
            let datagrams = split(range.clone(), max_datagram, &regions);
            groups.push(GroupLayout {id, range, slaves: regions, datagrams});
        }

        if offset > capacity
            {return Err(EthercatError::Capacity {required: offset, available: capacity})}
        Ok(Self {size: offset, groups})
    }

    pub fn group(&self, id: u8) -> Option<&GroupLayout> {
        self.groups.iter().find(|group| group.id == id)
    }
    /// region of the slave with the given station address
    pub fn region(&self, station: u16) -> Option<&SlaveRegion> {
        self.groups.iter()
            .flat_map(|group| group.slaves.iter())
            .find(|(address, _)| *address == station)
            .map(|(_, region)| region)
    }
}

/// split a group range in datagrams, counting the slaves crossed by each
fn split(range: Range<usize>, max_datagram: usize, regions: &[(u16, SlaveRegion)]) -> Vec<Datagram> {
    let mut datagrams = Vec::new();
    let mut start = range.start;
    while start < range.end {
        let end = range.end.min(start + max_datagram);
        let expected = regions.iter()
            .map(|(_, region)| {
                let mut expected = 0;
                if intersects(&region.outputs, start, end)  {expected += OUTPUT_WC}
                if intersects(&region.inputs, start, end)  {expected += INPUT_WC}
                expected
            })
            .fold(0u16, |total, expected| total.saturating_add(expected));
        datagrams.push(Datagram {range: start .. end, expected});
        start = end;
    }
    datagrams
}

fn intersects(region: &Range<usize>, start: usize, end: usize) -> bool {
    ! region.is_empty() && region.start < end && start < region.end
}


/// FMMU entry copying a whole byte range between logical and physical memory
pub fn fmmu_entry(logical: u32, length: u16, physical: u16, direction: SyncDirection) -> FmmuEntry {
    let mut entry = FmmuEntry::from(0u128);
    entry.set_logical_start_byte(logical);
    entry.set_logical_len_byte(length);
    entry.set_logical_start_bit(u3::new(0));
    entry.set_logical_end_bit(u3::new(7));
    entry.set_physical_start_byte(physical);
    entry.set_physical_start_bit(u3::new(0));
    entry.set_read(direction == SyncDirection::Read);
    entry.set_write(direction == SyncDirection::Write);
    entry.set_enable(true);
    entry
}

/// sync manager channel declared in the slave's EEPROM for the given usage
fn sync_manager(sync_managers: &[CategorySyncManager], usage: SyncManagerUsage) -> Option<(u8, CategorySyncManager)> {
    sync_managers.iter()
        .position(|channel| channel.usage() == usage)
        .and_then(|index| Some((u8::try_from(index).ok()?, sync_managers[index])))
}

/**
    program a slave's sync managers and FMMUs for its region of the image

    the outputs use the sync manager declared for process outputs and FMMU 0 (written by the master), the inputs use the sync manager declared for process inputs and FMMU 1 (read by the master)
*/
pub async fn configure_slave(master: &RawMaster, station: u16, region: &SlaveRegion, sync_managers: &[CategorySyncManager]) -> EthercatResult {
    let sides = [
        (&region.outputs, SyncManagerUsage::ProcessOut, SyncDirection::Write, 0),
        (&region.inputs, SyncManagerUsage::ProcessIn, SyncDirection::Read, 1),
        ];
    for (range, usage, direction, fmmu) in sides {
        if range.is_empty() {
            master.fpwr(station, registers::fmmu.entry(fmmu), FmmuEntry::from(0u128)).await?.one()?;
            continue;
        }
        let (channel, declared) = sync_manager(sync_managers, usage)
            .ok_or(EthercatError::Master("slave declares no sync manager for its process data"))?;
        let length = u16::try_from(range.len())
            .map_err(|_| EthercatError::Master("slave process data too big for a sync manager"))?;
        let logical = u32::try_from(range.start)
            .map_err(|_| EthercatError::Master("process image beyond logical memory"))?;
        debug!("slave {:#x}: SM{} at {:#x} and FMMU{} at logical {:#x}, {} bytes",
            station, channel, declared.address(), fmmu, logical, length);
        master.fpwr(station, registers::sync_manager::interface.channel(channel),
            SyncManagerChannel::configured(declared.address(), length, SyncMode::Buffered, direction),
            ).await?.one()?;
        master.fpwr(station, registers::fmmu.entry(fmmu),
            fmmu_entry(logical, length, declared.address(), direction),
            ).await?.one()?;
    }
    Ok(())
}
