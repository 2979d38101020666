//! File allocation table access: cluster addressing, chain walking and
//! allocation.

use std::collections::HashSet;

use byteorder::{BigEndian, ByteOrder};
use log::{debug, warn};

use crate::bitmap::ClusterBitmap;
use crate::boot_sector::{FatWidth, Partition};
use crate::device::BlockDevice;
use crate::error::{Error, ErrorContext};

/// FAT region bytes read per device call while loading the table.
const LOAD_CHUNK: usize = 0x1_0000;

/// Decoded meaning of one FAT slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatSlot {
    Free,
    EndOfChain,
    Bad,
    Next(u32),
    /// A reserved sentinel or a cluster index past the end of the partition.
    OutOfRange(u32),
}

impl FatSlot {
    pub fn decode(raw: u32, width: FatWidth, cluster_count: u32) -> Self {
        let (bad, end) = match width {
            FatWidth::Fat16 => (0xFFF7, 0xFFF8),
            FatWidth::Fat32 => (0xFFFF_FFF7, 0xFFFF_FFF8),
        };
        match raw {
            0 => FatSlot::Free,
            value if value >= end => FatSlot::EndOfChain,
            value if value == bad => FatSlot::Bad,
            value if value <= cluster_count => FatSlot::Next(value),
            value => FatSlot::OutOfRange(value),
        }
    }

    pub fn encode(self, width: FatWidth) -> u32 {
        match (self, width) {
            (FatSlot::Free, _) => 0,
            (FatSlot::EndOfChain, FatWidth::Fat16) => 0xFFFF,
            (FatSlot::EndOfChain, FatWidth::Fat32) => 0xFFFF_FFFF,
            (FatSlot::Bad, FatWidth::Fat16) => 0xFFF7,
            (FatSlot::Bad, FatWidth::Fat32) => 0xFFFF_FFF7,
            (FatSlot::Next(value), _) | (FatSlot::OutOfRange(value), _) => value,
        }
    }
}

/// The whole FAT of one partition plus its used/free bitmap. Loaded on first
/// use and kept in step with every slot written through [`ClusterAllocator`].
#[derive(Debug, Clone)]
pub struct FatTable {
    width: FatWidth,
    cluster_count: u32,
    slots: Vec<u32>,
    bitmap: ClusterBitmap,
}

impl FatTable {
    pub fn from_raw(width: FatWidth, cluster_count: u32, raw: &[u8]) -> Self {
        let step = width.bytes() as usize;
        let slots: Vec<u32> = raw
            .chunks_exact(step)
            .take(cluster_count as usize + 1)
            .map(|bytes| match width {
                FatWidth::Fat16 => u32::from(BigEndian::read_u16(bytes)),
                FatWidth::Fat32 => BigEndian::read_u32(bytes),
            })
            .collect();

        let mut bitmap = ClusterBitmap::new(cluster_count);
        for (cluster, value) in slots.iter().enumerate().skip(1) {
            if *value != 0 {
                bitmap.mark_used(cluster as u32);
            }
        }

        Self {
            width,
            cluster_count,
            slots,
            bitmap,
        }
    }

    pub fn slot(&self, cluster: u32) -> FatSlot {
        let raw = self.slots.get(cluster as usize).copied().unwrap_or(0);
        FatSlot::decode(raw, self.width, self.cluster_count)
    }

    pub fn bitmap(&self) -> &ClusterBitmap {
        &self.bitmap
    }

    fn set(&mut self, cluster: u32, slot: FatSlot) {
        if let Some(entry) = self.slots.get_mut(cluster as usize) {
            *entry = slot.encode(self.width);
        }
        match slot {
            FatSlot::Free => self.bitmap.mark_free(cluster),
            _ => self.bitmap.mark_used(cluster),
        }
    }
}

/// Cluster arithmetic and FAT mutations for one partition.
pub struct ClusterAllocator<'a, D: BlockDevice + ?Sized> {
    device: &'a mut D,
    partition: &'a mut Partition,
}

/// Byte offset of `cluster` within the device. Clusters are numbered from 1.
pub fn cluster_to_offset(partition: &Partition, cluster: u32) -> Result<u64, Error> {
    if !partition.is_data_cluster(cluster) {
        return Err(Error::format(
            ErrorContext::new("cluster to offset").with_path(&partition.name),
            format!(
                "cluster {cluster} outside 1..={}",
                partition.cluster_count
            ),
        ));
    }
    Ok(partition.data_offset + u64::from(cluster - 1) * partition.cluster_size)
}

/// Number of clusters needed to hold `bytes`.
pub fn clusters_for(partition: &Partition, bytes: u64) -> u64 {
    bytes.div_ceil(partition.cluster_size)
}

impl<'a, D: BlockDevice + ?Sized> ClusterAllocator<'a, D> {
    pub fn new(device: &'a mut D, partition: &'a mut Partition) -> Self {
        Self { device, partition }
    }

    pub fn partition(&self) -> &Partition {
        self.partition
    }

    pub fn cluster_to_offset(&self, cluster: u32) -> Result<u64, Error> {
        cluster_to_offset(self.partition, cluster)
    }

    fn table(&mut self) -> Result<&mut FatTable, Error> {
        let table = match self.partition.table.take() {
            Some(table) => table,
            None => self.load_table()?,
        };
        Ok(self.partition.table.insert(table))
    }

    fn load_table(&mut self) -> Result<FatTable, Error> {
        let partition = &*self.partition;
        let len = (u64::from(partition.cluster_count) + 1) * partition.fat_width.bytes();
        let mut raw = vec![0u8; len as usize];
        for (index, chunk) in raw.chunks_mut(LOAD_CHUNK).enumerate() {
            let offset = partition.fat_offset + (index * LOAD_CHUNK) as u64;
            self.device.read_at(offset, chunk).map_err(|e| {
                Error::device(
                    ErrorContext::at("read allocation table", offset).with_path(&partition.name),
                    e,
                )
            })?;
        }
        debug!(
            "loaded {} byte allocation table of {}",
            raw.len(),
            partition.name
        );
        Ok(FatTable::from_raw(
            partition.fat_width,
            partition.cluster_count,
            &raw,
        ))
    }

    pub fn slot(&mut self, cluster: u32) -> Result<FatSlot, Error> {
        Ok(self.table()?.slot(cluster))
    }

    pub fn free_clusters(&mut self) -> Result<u32, Error> {
        Ok(self.table()?.bitmap.free_count())
    }

    pub fn used_clusters(&mut self) -> Result<u32, Error> {
        Ok(self.table()?.bitmap.used_count())
    }

    /// Follows the FAT from `first_cluster` to the end-of-chain sentinel. The
    /// walk is bounded by the cluster count; revisiting a cluster, reaching a
    /// free, bad or out-of-range slot are all reported as corruption.
    pub fn resolve_chain(&mut self, first_cluster: u32) -> Result<Vec<u32>, Error> {
        if first_cluster == 0 {
            return Ok(Vec::new());
        }

        let cluster_count = self.partition.cluster_count;
        let name = self.partition.name.clone();
        let corrupt = |offset: u64, reason: String| {
            warn!("corrupt cluster chain on {name}: {reason}");
            Error::format(ErrorContext::at("resolve chain", offset), reason)
        };

        if first_cluster > cluster_count {
            return Err(corrupt(
                self.partition.fat_offset,
                format!("first cluster {first_cluster} outside 1..={cluster_count}"),
            ));
        }

        let mut seen = HashSet::new();
        let mut chain = Vec::new();
        let mut current = first_cluster;
        loop {
            let offset = self.partition.fat_slot_offset(current);
            if !seen.insert(current) {
                return Err(corrupt(
                    offset,
                    format!("cluster {current} revisited before the end of the chain"),
                ));
            }
            if chain.len() as u64 >= u64::from(cluster_count) {
                return Err(corrupt(
                    offset,
                    format!("chain runs past all {cluster_count} clusters without ending"),
                ));
            }
            chain.push(current);

            match self.table()?.slot(current) {
                FatSlot::EndOfChain => break,
                FatSlot::Next(next) => current = next,
                FatSlot::Free => {
                    return Err(corrupt(offset, format!("cluster {current} is marked free")));
                }
                FatSlot::Bad => {
                    return Err(corrupt(offset, format!("cluster {current} is marked bad")));
                }
                FatSlot::OutOfRange(value) => {
                    return Err(corrupt(
                        offset,
                        format!("cluster {current} links to out-of-range value {value:#x}"),
                    ));
                }
            }
        }
        Ok(chain)
    }

    /// Picks `count` free clusters (see [`ClusterBitmap::select`]) and writes
    /// them to the FAT as one terminated chain. Nothing is written when the
    /// request cannot be met.
    pub fn find_free_run(&mut self, count: u32) -> Result<Vec<u32>, Error> {
        let partition = self.partition.name.clone();
        let table = self.table()?;
        let available = table.bitmap.free_count();
        let Some(clusters) = table.bitmap.select(count) else {
            return Err(Error::OutOfSpace {
                partition,
                requested: count,
                available,
            });
        };

        let mut updates = Vec::with_capacity(clusters.len());
        for pair in clusters.windows(2) {
            updates.push((pair[0], FatSlot::Next(pair[1])));
        }
        if let Some(last) = clusters.last() {
            updates.push((*last, FatSlot::EndOfChain));
        }
        self.write_slots(&updates)?;
        Ok(clusters)
    }

    /// Grows `chain` by `additional` clusters. The new clusters are written
    /// as a terminated chain before the old tail is pointed at them, so an
    /// interruption can only leak them. Returns the clusters added.
    pub fn extend_chain(&mut self, chain: &mut Vec<u32>, additional: u32) -> Result<Vec<u32>, Error> {
        let added = self.find_free_run(additional)?;
        if let (Some(tail), Some(head)) = (chain.last(), added.first()) {
            self.write_slots(&[(*tail, FatSlot::Next(*head))])?;
        }
        chain.extend_from_slice(&added);
        Ok(added)
    }

    /// Marks every cluster of `chain` free.
    pub fn free_chain(&mut self, chain: &[u32]) -> Result<(), Error> {
        let updates: Vec<(u32, FatSlot)> = chain
            .iter()
            .map(|cluster| (*cluster, FatSlot::Free))
            .collect();
        self.write_slots(&updates)
    }

    /// Writes FAT slots, coalescing runs of consecutive clusters into single
    /// device writes, and mirrors them into the cached table.
    pub fn write_slots(&mut self, updates: &[(u32, FatSlot)]) -> Result<(), Error> {
        let width = self.partition.fat_width;
        let step = width.bytes() as usize;

        let mut index = 0;
        while index < updates.len() {
            let mut end = index + 1;
            while end < updates.len() && updates[end].0 == updates[end - 1].0 + 1 {
                end += 1;
            }

            let run = &updates[index..end];
            let mut buf = vec![0u8; run.len() * step];
            for ((cluster, slot), bytes) in run.iter().zip(buf.chunks_exact_mut(step)) {
                if !self.partition.is_data_cluster(*cluster) {
                    return Err(Error::format(
                        ErrorContext::new("write allocation table").with_path(&self.partition.name),
                        format!("cluster {cluster} is not a data cluster"),
                    ));
                }
                let value = slot.encode(width);
                match width {
                    FatWidth::Fat16 => BigEndian::write_u16(bytes, value as u16),
                    FatWidth::Fat32 => BigEndian::write_u32(bytes, value),
                }
            }

            let offset = self.partition.fat_slot_offset(run[0].0);
            let written = self.device.write_at(offset, &buf).map_err(|e| {
                Error::device(
                    ErrorContext::at("write allocation table", offset)
                        .with_path(&self.partition.name),
                    e,
                )
            })?;
            if written != buf.len() {
                return Err(Error::device(
                    ErrorContext::at("write allocation table", offset)
                        .with_path(&self.partition.name),
                    std::io::Error::new(std::io::ErrorKind::WriteZero, "short write"),
                ));
            }

            let table = self.table()?;
            for (cluster, slot) in run {
                table.set(*cluster, *slot);
            }
            index = end;
        }
        Ok(())
    }
}
