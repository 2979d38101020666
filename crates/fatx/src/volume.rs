//! Mounting a device and everything that walks or mutates its directory
//! trees.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt};
use log::{debug, info, warn};
use xbox_filetypes::{PackedTimestamp, SecurityBlob};

use crate::boot_sector::{parse_partition, Partition, PartitionId};
use crate::device::{BlockDevice, FileDevice};
use crate::dir_entry::{validate_name, DirRecord, NameStatus, DIR_RECORD_SIZE};
use crate::entry::{Cache, DirectoryListing, EntryId, FileEntry, NewEntry};
use crate::error::{Error, ErrorContext};
use crate::fat::{cluster_to_offset, clusters_for, ClusterAllocator, FatSlot};
use crate::layout::DeviceLayout;
use crate::stream::FatxStream;

/// Bytes moved per device call when copying file contents in or out.
const COPY_CHUNK: usize = 0x1_0000;
const RECORD_SIZE: u64 = DIR_RECORD_SIZE as u64;
const DRIVE_NAME_PATH: &str = "Content\\name.txt";
const DRIVE_NAME_MAX_CHARS: u32 = 26;
const UTF16_BOM: u16 = 0xFEFF;

#[derive(Debug)]
pub enum SlotOutcome {
    Mounted(PartitionId),
    /// No magic, or the slot lies beyond the end of the device.
    Missing,
    Rejected(Error),
}

#[derive(Debug)]
pub struct SlotReport {
    pub name: String,
    pub offset: u64,
    pub outcome: SlotOutcome,
}

/// An open device with every partition that mounted. Entries are addressed
/// by [`EntryId`] handles into an arena owned by the volume; closing the
/// volume consumes it, so no handle outlives the device.
pub struct FatxVolume<D: BlockDevice> {
    device: D,
    layout: DeviceLayout,
    partitions: Vec<Partition>,
    reports: Vec<SlotReport>,
    entries: Vec<Option<FileEntry>>,
}

fn lookup(entries: &[Option<FileEntry>], id: EntryId) -> Result<&FileEntry, Error> {
    entries
        .get(id.0)
        .and_then(Option::as_ref)
        .ok_or_else(|| Error::NotFound(format!("entry #{}", id.0)))
}

fn lookup_mut(entries: &mut [Option<FileEntry>], id: EntryId) -> Result<&mut FileEntry, Error> {
    entries
        .get_mut(id.0)
        .and_then(Option::as_mut)
        .ok_or_else(|| Error::NotFound(format!("entry #{}", id.0)))
}

fn unresolved(operation: &'static str, path: &str) -> Error {
    Error::format(ErrorContext::new(operation).with_path(path), "cache not resolved")
}

fn records_per_cluster(partition: &Partition) -> u32 {
    (partition.cluster_size / RECORD_SIZE) as u32
}

/// Device offset of directory record `slot` inside a directory's chain.
fn record_offset(partition: &Partition, chain: &[u32], slot: u32) -> Result<u64, Error> {
    let byte = u64::from(slot) * RECORD_SIZE;
    let index = (byte / partition.cluster_size) as usize;
    let Some(cluster) = chain.get(index) else {
        return Err(Error::format(
            ErrorContext::new("locate directory record"),
            format!(
                "slot {slot} lies beyond the directory's {} clusters",
                chain.len()
            ),
        ));
    };
    Ok(cluster_to_offset(partition, *cluster)? + byte % partition.cluster_size)
}

fn write_exact<D: BlockDevice + ?Sized>(
    device: &mut D,
    operation: &'static str,
    offset: u64,
    data: &[u8],
) -> Result<(), Error> {
    let written = device
        .write_at(offset, data)
        .map_err(|e| Error::device(ErrorContext::at(operation, offset), e))?;
    if written != data.len() {
        return Err(Error::device(
            ErrorContext::at(operation, offset),
            io::Error::new(
                io::ErrorKind::WriteZero,
                format!("wrote {written} of {} bytes", data.len()),
            ),
        ));
    }
    Ok(())
}

/// Reads `buf.len()` bytes starting at logical offset `offset` of `chain`,
/// one device read per cluster touched.
fn read_span<D: BlockDevice + ?Sized>(
    device: &mut D,
    partition: &Partition,
    chain: &[u32],
    offset: u64,
    buf: &mut [u8],
) -> Result<(), Error> {
    let cluster_size = partition.cluster_size;
    let mut done = 0usize;
    while done < buf.len() {
        let position = offset + done as u64;
        let Some(cluster) = chain.get((position / cluster_size) as usize) else {
            return Err(Error::format(
                ErrorContext::new("read file"),
                format!(
                    "cluster chain of {} clusters ends before byte {position}",
                    chain.len()
                ),
            ));
        };
        let intra = position % cluster_size;
        let len = ((cluster_size - intra) as usize).min(buf.len() - done);
        let device_offset = cluster_to_offset(partition, *cluster)? + intra;
        device
            .read_at(device_offset, &mut buf[done..done + len])
            .map_err(|e| Error::device(ErrorContext::at("read file", device_offset), e))?;
        done += len;
    }
    Ok(())
}

fn write_span<D: BlockDevice + ?Sized>(
    device: &mut D,
    partition: &Partition,
    chain: &[u32],
    offset: u64,
    data: &[u8],
) -> Result<(), Error> {
    let cluster_size = partition.cluster_size;
    let mut done = 0usize;
    while done < data.len() {
        let position = offset + done as u64;
        let Some(cluster) = chain.get((position / cluster_size) as usize) else {
            return Err(Error::format(
                ErrorContext::new("write file"),
                format!(
                    "cluster chain of {} clusters ends before byte {position}",
                    chain.len()
                ),
            ));
        };
        let intra = position % cluster_size;
        let len = ((cluster_size - intra) as usize).min(data.len() - done);
        let device_offset = cluster_to_offset(partition, *cluster)? + intra;
        write_exact(device, "write file", device_offset, &data[done..done + len])?;
        done += len;
    }
    Ok(())
}

fn fill_clusters<D: BlockDevice + ?Sized>(
    device: &mut D,
    partition: &Partition,
    clusters: &[u32],
    byte: u8,
) -> Result<(), Error> {
    let buf = vec![byte; partition.cluster_size as usize];
    for cluster in clusters {
        let offset = cluster_to_offset(partition, *cluster)?;
        write_exact(device, "initialise cluster", offset, &buf)?;
    }
    Ok(())
}

impl FatxVolume<FileDevice> {
    pub fn open(path: &Path, layout: DeviceLayout) -> Result<Self, Error> {
        let device = FileDevice::open(path).map_err(|e| {
            Error::device(
                ErrorContext::new("open device").with_path(path.display().to_string()),
                e,
            )
        })?;
        Self::from_device(device, layout)
    }

    pub fn open_read_only(path: &Path, layout: DeviceLayout) -> Result<Self, Error> {
        let device = FileDevice::open_read_only(path).map_err(|e| {
            Error::device(
                ErrorContext::new("open device").with_path(path.display().to_string()),
                e,
            )
        })?;
        Self::from_device(device, layout)
    }
}

impl<D: BlockDevice> FatxVolume<D> {
    /// Probes every slot of `layout`. A slot without magic or with a broken
    /// header is recorded in [`Self::slot_reports`]; only failing to query
    /// the device itself fails the whole open.
    pub fn from_device(mut device: D, layout: DeviceLayout) -> Result<Self, Error> {
        layout.validate()?;
        let device_len = device
            .len()
            .map_err(|e| Error::device(ErrorContext::new("query device size"), e))?;

        let mut partitions = Vec::new();
        let mut reports = Vec::new();
        let mut entries = Vec::new();
        for slot in &layout.partitions {
            let root = EntryId(entries.len());
            let outcome = match parse_partition(&mut device, slot, device_len, root) {
                Ok(Some(partition)) => {
                    let id = PartitionId(partitions.len());
                    info!(
                        "mounted {} at {:#x}: {} clusters of {:#x} bytes",
                        partition.name,
                        partition.offset,
                        partition.cluster_count,
                        partition.cluster_size
                    );
                    entries.push(Some(FileEntry::root(
                        id,
                        &partition.name,
                        partition.root_dir_first_cluster,
                    )));
                    partitions.push(partition);
                    SlotOutcome::Mounted(id)
                }
                Ok(None) => SlotOutcome::Missing,
                Err(err) => {
                    warn!("rejected partition slot {}: {err}", slot.name);
                    SlotOutcome::Rejected(err)
                }
            };
            reports.push(SlotReport {
                name: slot.name.clone(),
                offset: slot.offset,
                outcome,
            });
        }

        Ok(Self {
            device,
            layout,
            partitions,
            reports,
            entries,
        })
    }

    pub fn layout(&self) -> &DeviceLayout {
        &self.layout
    }

    pub fn slot_reports(&self) -> &[SlotReport] {
        &self.reports
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn partition_ids(&self) -> impl Iterator<Item = PartitionId> {
        (0..self.partitions.len()).map(PartitionId)
    }

    pub fn partition(&self, id: PartitionId) -> Result<&Partition, Error> {
        self.partitions
            .get(id.0)
            .ok_or_else(|| Error::NotFound(format!("partition #{}", id.0)))
    }

    pub fn partition_by_name(&self, name: &str) -> Option<PartitionId> {
        self.partitions
            .iter()
            .position(|partition| partition.name.eq_ignore_ascii_case(name))
            .map(PartitionId)
    }

    pub fn entry(&self, id: EntryId) -> Result<&FileEntry, Error> {
        lookup(&self.entries, id)
    }

    fn allocator(&mut self, id: PartitionId) -> Result<ClusterAllocator<'_, D>, Error> {
        let partition = self
            .partitions
            .get_mut(id.0)
            .ok_or_else(|| Error::NotFound(format!("partition #{}", id.0)))?;
        Ok(ClusterAllocator::new(&mut self.device, partition))
    }

    pub fn free_clusters(&mut self, id: PartitionId) -> Result<u32, Error> {
        self.allocator(id)?.free_clusters()
    }

    pub fn used_clusters(&mut self, id: PartitionId) -> Result<u32, Error> {
        self.allocator(id)?.used_clusters()
    }

    /// Free space in bytes, for capacity reporting.
    pub fn free_bytes(&mut self, id: PartitionId) -> Result<u64, Error> {
        let free = self.free_clusters(id)?;
        Ok(u64::from(free) * self.partition(id)?.cluster_size)
    }

    pub fn total_bytes(&self, id: PartitionId) -> Result<u64, Error> {
        Ok(self.partition(id)?.total_bytes())
    }

    fn ensure_chain(&mut self, id: EntryId) -> Result<(), Error> {
        let entry = lookup(&self.entries, id)?;
        if entry.chain.get().is_some() {
            return Ok(());
        }
        let first_cluster = entry.first_cluster;
        let partition = entry.partition;
        let path = entry.full_path();
        let chain = self
            .allocator(partition)?
            .resolve_chain(first_cluster)
            .map_err(|e| e.with_path(&path))?;
        debug!("resolved {path}: {} clusters", chain.len());
        lookup_mut(&mut self.entries, id)?.chain = Cache::Resolved(chain);
        Ok(())
    }

    /// Ordered cluster indices of an entry, resolved on first use.
    pub fn cluster_chain(&mut self, id: EntryId) -> Result<&[u32], Error> {
        self.ensure_chain(id)?;
        Ok(lookup(&self.entries, id)?
            .chain
            .get()
            .map(Vec::as_slice)
            .unwrap_or_default())
    }

    fn load_listing(&mut self, id: EntryId) -> Result<(), Error> {
        let entry = lookup(&self.entries, id)?;
        if !entry.is_directory() {
            return Err(Error::InvalidArgument(format!(
                "{} is not a directory",
                entry.full_path()
            )));
        }
        if entry.children.get().is_some() {
            return Ok(());
        }
        self.ensure_chain(id)?;

        let Self {
            device,
            partitions,
            entries,
            ..
        } = self;
        let entry = lookup(entries, id)?;
        let partition_id = entry.partition;
        let partition = &partitions[partition_id.0];
        let path = entry.full_path();
        let chain = entry.chain.get().cloned().unwrap_or_default();

        let per_cluster = records_per_cluster(partition);
        let mut listing = DirectoryListing {
            capacity: chain.len() as u32 * per_cluster,
            ..DirectoryListing::default()
        };
        let mut records = Vec::new();
        let mut cluster = vec![0u8; partition.cluster_size as usize];

        'chain: for (index, cluster_index) in chain.iter().enumerate() {
            let cluster_offset = cluster_to_offset(partition, *cluster_index)?;
            device.read_at(cluster_offset, &mut cluster).map_err(|e| {
                Error::device(
                    ErrorContext::at("read directory", cluster_offset).with_path(&path),
                    e,
                )
            })?;
            for (position, raw) in cluster.chunks_exact(DIR_RECORD_SIZE).enumerate() {
                let slot = index as u32 * per_cluster + position as u32;
                let record = DirRecord::decode(raw).map_err(|reason| {
                    Error::format(
                        ErrorContext::at(
                            "decode directory",
                            cluster_offset + position as u64 * RECORD_SIZE,
                        )
                        .with_path(&path),
                        reason,
                    )
                })?;
                match record.status {
                    NameStatus::EndOfDirectory => {
                        listing.end_slot = Some(slot);
                        break 'chain;
                    }
                    NameStatus::Unused | NameStatus::Deleted => listing.free_slots.push(slot),
                    NameStatus::Valid(_) => records.push((slot, record)),
                }
            }
        }

        for (slot, record) in records {
            let child = FileEntry::from_record(record, partition_id, id, path.clone(), slot);
            listing.children.push(EntryId(entries.len()));
            entries.push(Some(child));
        }
        debug!("decoded {path}: {} live entries", listing.children.len());
        lookup_mut(entries, id)?.children = Cache::Resolved(listing);
        Ok(())
    }

    /// Live children of a directory in record order. Decoded once and kept
    /// until a mutation or [`Self::invalidate`] touches the directory.
    pub fn get_child_file_entries(&mut self, id: EntryId) -> Result<Vec<EntryId>, Error> {
        self.load_listing(id)?;
        let entry = lookup(&self.entries, id)?;
        entry
            .children
            .get()
            .map(|listing| listing.children.clone())
            .ok_or_else(|| unresolved("list directory", &entry.full_path()))
    }

    /// Drops the cached contents of an entry. Handles to the children of a
    /// directory become stale and resolve to `NotFound` afterwards.
    pub fn invalidate(&mut self, id: EntryId) -> Result<(), Error> {
        let entry = lookup_mut(&mut self.entries, id)?;
        entry.chain = Cache::Unresolved;
        entry.magic = Cache::Unresolved;
        let Some(listing) = entry.children.take() else {
            return Ok(());
        };

        let mut stack = listing.children;
        while let Some(child) = stack.pop() {
            if let Some(Some(mut removed)) = self.entries.get_mut(child.0).map(Option::take) {
                if let Some(listing) = removed.children.take() {
                    stack.extend(listing.children);
                }
            }
        }
        Ok(())
    }

    /// Writes `data` over directory record `slot` of `dir`, starting at the
    /// record's first byte.
    fn write_record_bytes(&mut self, dir: EntryId, slot: u32, data: &[u8]) -> Result<(), Error> {
        self.ensure_chain(dir)?;
        let Self {
            device,
            partitions,
            entries,
            ..
        } = self;
        let entry = lookup(entries, dir)?;
        let partition = &partitions[entry.partition.0];
        let chain = entry.chain.get().map(Vec::as_slice).unwrap_or_default();
        let offset =
            record_offset(partition, chain, slot).map_err(|e| e.with_path(&entry.full_path()))?;
        write_exact(device, "write directory record", offset, data)
            .map_err(|e| e.with_path(&entry.full_path()))
    }

    fn write_entry_record(&mut self, id: EntryId) -> Result<(), Error> {
        let entry = lookup(&self.entries, id)?;
        let (Some(parent), Some(slot)) = (entry.parent, entry.slot) else {
            return Ok(());
        };
        let bytes = entry.to_record().encode();
        self.write_record_bytes(parent, slot, &bytes)
    }

    /// Appends one cluster of end markers to a directory. The cluster is
    /// initialised before the old tail is linked to it.
    fn grow_directory(&mut self, dir: EntryId) -> Result<(), Error> {
        self.ensure_chain(dir)?;
        let Self {
            device,
            partitions,
            entries,
            ..
        } = self;
        let entry = lookup_mut(entries, dir)?;
        let path = entry.full_path();
        let partition = &mut partitions[entry.partition.0];
        let Some(chain) = entry.chain.get_mut() else {
            return Err(unresolved("grow directory", &path));
        };
        let Some(tail) = chain.last().copied() else {
            return Err(Error::format(
                ErrorContext::new("grow directory").with_path(&path),
                "directory owns no clusters",
            ));
        };

        let added = ClusterAllocator::new(&mut *device, &mut *partition).find_free_run(1)?;
        fill_clusters(&mut *device, partition, &added, 0xFF)?;
        ClusterAllocator::new(&mut *device, &mut *partition)
            .write_slots(&[(tail, FatSlot::Next(added[0]))])?;
        chain.extend_from_slice(&added);

        let per_cluster = records_per_cluster(partition);
        if let Some(listing) = entry.children.get_mut() {
            let old_capacity = listing.capacity;
            listing.capacity += per_cluster;
            if listing.end_slot.is_none() {
                listing.end_slot = Some(old_capacity);
            }
        }
        debug!("grew directory {path} to {} clusters", chain.len());
        Ok(())
    }

    /// Adds a file or directory under `parent`, reusing a deleted record slot
    /// when one exists. Files get a chain sized to `file_size` (zero filled);
    /// directories get one cluster of end markers.
    pub fn create_file_entry(&mut self, parent: EntryId, new: NewEntry) -> Result<EntryId, Error> {
        self.create_entry(parent, new, true)
    }

    fn create_entry(
        &mut self,
        parent: EntryId,
        new: NewEntry,
        zero_fill: bool,
    ) -> Result<EntryId, Error> {
        validate_name(&new.name)?;
        self.load_listing(parent)?;

        let parent_entry = lookup(&self.entries, parent)?;
        let parent_path = parent_entry.full_path();
        let partition_id = parent_entry.partition;
        let Some(listing) = parent_entry.children.get() else {
            return Err(unresolved("create entry", &parent_path));
        };
        for child in &listing.children {
            if lookup(&self.entries, *child)?
                .name
                .eq_ignore_ascii_case(&new.name)
            {
                return Err(Error::InvalidArgument(format!(
                    "{parent_path} already contains '{}'",
                    new.name
                )));
            }
        }
        let slot = listing.next_slot();
        let needs_growth = slot >= listing.capacity;
        let appends_at_end = listing.end_slot == Some(slot);

        let partition = self.partition(partition_id)?;
        let data_clusters = if new.is_directory() {
            1
        } else {
            clusters_for(partition, u64::from(new.file_size)) as u32
        };
        let required = data_clusters + u32::from(needs_growth);
        let partition_name = partition.name.clone();
        let available = self.free_clusters(partition_id)?;
        if required > available {
            return Err(Error::OutOfSpace {
                partition: partition_name,
                requested: required,
                available,
            });
        }

        if needs_growth {
            self.grow_directory(parent)?;
        }

        let chain = self.allocator(partition_id)?.find_free_run(data_clusters)?;
        let partition = &self.partitions[partition_id.0];
        if new.is_directory() {
            fill_clusters(&mut self.device, partition, &chain, 0xFF)?;
        } else if zero_fill {
            fill_clusters(&mut self.device, partition, &chain, 0x00)?;
        }
        let per_cluster = records_per_cluster(partition);

        let capacity = lookup(&self.entries, parent)?
            .children
            .get()
            .map_or(0, |listing| listing.capacity);
        if appends_at_end && slot + 1 < capacity {
            self.write_record_bytes(parent, slot + 1, &[0xFF; DIR_RECORD_SIZE])?;
        }

        let entry = FileEntry {
            name: new.name,
            attributes: new.attributes,
            first_cluster: chain.first().copied().unwrap_or(0),
            file_size: if new.attributes.is_directory() {
                0
            } else {
                new.file_size
            },
            created: new.created,
            modified: new.modified,
            accessed: new.accessed,
            partition: partition_id,
            parent: Some(parent),
            path: parent_path,
            slot: Some(slot),
            children: if new.attributes.is_directory() {
                Cache::Resolved(DirectoryListing {
                    end_slot: Some(0),
                    capacity: per_cluster,
                    ..DirectoryListing::default()
                })
            } else {
                Cache::Unresolved
            },
            chain: Cache::Resolved(chain),
            magic: Cache::Unresolved,
        };
        let full_path = entry.full_path();
        let bytes = entry.to_record().encode();
        self.write_record_bytes(parent, slot, &bytes)?;

        let id = EntryId(self.entries.len());
        self.entries.push(Some(entry));

        let position = {
            let Some(listing) = lookup(&self.entries, parent)?.children.get() else {
                return Err(Error::NotFound(format!("listing of {full_path}")));
            };
            listing
                .children
                .iter()
                .position(|child| {
                    lookup(&self.entries, *child)
                        .map(|e| e.slot > Some(slot))
                        .unwrap_or(false)
                })
                .unwrap_or(listing.children.len())
        };
        if let Some(listing) = lookup_mut(&mut self.entries, parent)?.children.get_mut() {
            listing.claim(slot);
            listing.children.insert(position, id);
        }

        info!("created {full_path}");
        Ok(id)
    }

    /// `id` and everything below it, parents before children and siblings
    /// in record order. A directory whose first cluster already appeared in
    /// the walk makes the tree cyclic and is reported as corruption.
    fn subtree(&mut self, id: EntryId, operation: &'static str) -> Result<Vec<EntryId>, Error> {
        let entry = lookup(&self.entries, id)?;
        let root_cluster = self.partitions[entry.partition.0].root_dir_first_cluster;
        let mut expanded = HashSet::from([root_cluster]);

        let mut visited = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            visited.push(current);
            let entry = lookup(&self.entries, current)?;
            if !entry.is_directory() {
                continue;
            }
            let first_cluster = entry.first_cluster;
            if !entry.is_root() && first_cluster != 0 && !expanded.insert(first_cluster) {
                let path = entry.full_path();
                warn!("directory cycle at {path}: cluster {first_cluster} is already in the tree");
                return Err(Error::format(
                    ErrorContext::new(operation).with_path(path),
                    format!("directory cluster {first_cluster} is already part of the tree"),
                ));
            }
            let children = self.get_child_file_entries(current)?;
            stack.extend(children.into_iter().rev());
        }
        Ok(visited)
    }

    /// Deletes an entry; directories are emptied first, deepest entries
    /// before their parents. Returns the number of entries removed. Nothing
    /// is freed when any part of the subtree is corrupt.
    pub fn delete_file(&mut self, id: EntryId) -> Result<usize, Error> {
        let entry = lookup(&self.entries, id)?;
        if entry.is_root() {
            return Err(Error::InvalidArgument(format!(
                "the root of {} cannot be deleted",
                entry.path
            )));
        }
        let path = entry.full_path();

        // Every listing and chain is resolved before the first slot is freed.
        let doomed = self.subtree(id, "delete entry")?;
        for current in &doomed {
            self.ensure_chain(*current)?;
        }
        let mut removed = 0;
        for current in doomed.into_iter().rev() {
            self.remove_entry(current)?;
            removed += 1;
        }

        info!("deleted {path} ({removed} entries)");
        Ok(removed)
    }

    /// Frees one entry's clusters, then marks its record deleted.
    fn remove_entry(&mut self, id: EntryId) -> Result<(), Error> {
        self.ensure_chain(id)?;
        let entry = lookup_mut(&mut self.entries, id)?;
        let path = entry.full_path();
        let partition_id = entry.partition;
        let (Some(parent), Some(slot)) = (entry.parent, entry.slot) else {
            return Err(Error::InvalidArgument(format!("{path} has no parent")));
        };
        let chain = entry.chain.take().unwrap_or_default();

        self.allocator(partition_id)?
            .free_chain(&chain)
            .map_err(|e| e.with_path(&path))?;
        self.write_record_bytes(parent, slot, &[NameStatus::Deleted.to_byte()])?;

        if let Some(listing) = lookup_mut(&mut self.entries, parent)?.children.get_mut() {
            listing.children.retain(|child| *child != id);
            listing.release(slot);
        }
        self.entries[id.0] = None;
        debug!("removed {path}");
        Ok(())
    }

    /// Grows the chain of a file until it can hold `end` bytes.
    fn ensure_capacity(&mut self, id: EntryId, end: u64) -> Result<(), Error> {
        self.ensure_chain(id)?;
        let Self {
            device,
            partitions,
            entries,
            ..
        } = self;
        let entry = lookup_mut(entries, id)?;
        let path = entry.full_path();
        let partition = &mut partitions[entry.partition.0];
        let Some(chain) = entry.chain.get_mut() else {
            return Err(unresolved("extend file", &path));
        };

        let capacity = chain.len() as u64 * partition.cluster_size;
        if end <= capacity {
            return Ok(());
        }
        let additional = u32::try_from(clusters_for(partition, end - capacity))
            .map_err(|_| Error::InvalidArgument(format!("{path} cannot grow to {end} bytes")))?;
        let was_empty = chain.is_empty();
        ClusterAllocator::new(&mut *device, partition)
            .extend_chain(chain, additional)
            .map_err(|e| e.with_path(&path))?;
        if was_empty {
            entry.first_cluster = chain.first().copied().unwrap_or(0);
        }
        debug!("extended {path} by {additional} clusters");
        Ok(())
    }

    /// Reads up to `buf.len()` bytes at `offset`. Returns 0 at or past the
    /// end of the file.
    pub fn read_entry_at(&mut self, id: EntryId, offset: u64, buf: &mut [u8]) -> Result<usize, Error> {
        let entry = lookup(&self.entries, id)?;
        if entry.is_directory() {
            return Err(Error::InvalidArgument(format!(
                "{} is a directory",
                entry.full_path()
            )));
        }
        let size = u64::from(entry.file_size);
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let len = (size - offset).min(buf.len() as u64) as usize;

        self.ensure_chain(id)?;
        let Self {
            device,
            partitions,
            entries,
            ..
        } = self;
        let entry = lookup(entries, id)?;
        let chain = entry.chain.get().map(Vec::as_slice).unwrap_or_default();
        read_span(
            device,
            &partitions[entry.partition.0],
            chain,
            offset,
            &mut buf[..len],
        )
        .map_err(|e| e.with_path(&entry.full_path()))?;
        Ok(len)
    }

    /// Writes `data` at `offset`, growing the file (and zero filling any gap)
    /// when the write ends past the current size.
    pub fn write_entry_at(&mut self, id: EntryId, offset: u64, data: &[u8]) -> Result<usize, Error> {
        let entry = lookup(&self.entries, id)?;
        let path = entry.full_path();
        if entry.is_directory() {
            return Err(Error::InvalidArgument(format!("{path} is a directory")));
        }
        if data.is_empty() {
            return Ok(0);
        }
        let old_size = u64::from(entry.file_size);
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|end| *end <= u64::from(u32::MAX))
            .ok_or_else(|| {
                Error::InvalidArgument(format!("{path} cannot grow past {} bytes", u32::MAX))
            })?;

        self.ensure_capacity(id, end)?;

        let Self {
            device,
            partitions,
            entries,
            ..
        } = self;
        let entry = lookup_mut(entries, id)?;
        let partition = &partitions[entry.partition.0];
        let chain = entry.chain.get().map(Vec::as_slice).unwrap_or_default();
        if offset > old_size {
            let zeros = vec![0u8; COPY_CHUNK];
            let mut position = old_size;
            while position < offset {
                let len = (offset - position).min(COPY_CHUNK as u64) as usize;
                write_span(&mut *device, partition, chain, position, &zeros[..len])
                    .map_err(|e| e.with_path(&path))?;
                position += len as u64;
            }
        }
        write_span(&mut *device, partition, chain, offset, data).map_err(|e| e.with_path(&path))?;
        entry.magic = Cache::Unresolved;

        if end > old_size {
            entry.file_size = end as u32;
            self.write_entry_record(id)?;
        }
        Ok(data.len())
    }

    /// Cuts a file back to `size` bytes. The record shrinks first, then the
    /// new tail is terminated and the clusters past it are freed.
    fn shrink_entry(&mut self, id: EntryId, size: u64) -> Result<(), Error> {
        self.ensure_chain(id)?;
        let entry = lookup(&self.entries, id)?;
        let partition_id = entry.partition;
        let path = entry.full_path();
        let keep = clusters_for(self.partition(partition_id)?, size) as usize;

        let entry = lookup_mut(&mut self.entries, id)?;
        let (released, tail, first_cluster) = {
            let Some(chain) = entry.chain.get_mut() else {
                return Err(unresolved("shrink file", &path));
            };
            let released = chain.split_off(keep.min(chain.len()));
            (
                released,
                chain.last().copied(),
                chain.first().copied().unwrap_or(0),
            )
        };
        entry.first_cluster = first_cluster;
        entry.file_size = size as u32;
        entry.magic = Cache::Unresolved;
        self.write_entry_record(id)?;

        let mut allocator = self.allocator(partition_id)?;
        if let Some(tail) = tail {
            allocator.write_slots(&[(tail, FatSlot::EndOfChain)])?;
        }
        allocator
            .free_chain(&released)
            .map_err(|e| e.with_path(&path))?;
        debug!("cut {path} to {size} bytes, freed {} clusters", released.len());
        Ok(())
    }

    /// Opens a byte cursor over a file.
    pub fn stream(&mut self, id: EntryId) -> Result<FatxStream<'_, D>, Error> {
        let entry = lookup(&self.entries, id)?;
        if entry.is_directory() {
            return Err(Error::InvalidArgument(format!(
                "{} is a directory",
                entry.full_path()
            )));
        }
        Ok(FatxStream::new(self, id))
    }

    /// Copies a host file into `parent` under `name`.
    pub fn inject_file(&mut self, parent: EntryId, name: &str, source: &Path) -> Result<EntryId, Error> {
        let host_context = || ErrorContext::new("open host file").with_path(source.display().to_string());
        let file = File::open(source).map_err(|e| Error::device(host_context(), e))?;
        let metadata = file.metadata().map_err(|e| Error::device(host_context(), e))?;
        let size = u32::try_from(metadata.len()).map_err(|_| {
            Error::InvalidArgument(format!(
                "{} is too large for a FATX file",
                source.display()
            ))
        })?;

        let mut new = NewEntry::file(name, size);
        if let Ok(modified) = metadata.modified() {
            new = new.with_timestamps(PackedTimestamp::from_system_time(modified));
        }
        self.inject_reader(parent, new, file)
    }

    /// Creates a file of `new.file_size` bytes and fills it from `reader` in
    /// bounded chunks.
    pub fn inject_reader<R: Read>(
        &mut self,
        parent: EntryId,
        new: NewEntry,
        mut reader: R,
    ) -> Result<EntryId, Error> {
        if new.is_directory() {
            return Err(Error::InvalidArgument(format!(
                "cannot inject data into directory '{}'",
                new.name
            )));
        }
        let total = u64::from(new.file_size);
        let id = self.create_entry(parent, new, false)?;
        let path = self.entry(id)?.full_path();

        let mut buf = vec![0u8; COPY_CHUNK];
        let mut copied = 0u64;
        let outcome = loop {
            if copied >= total {
                break Ok(());
            }
            let want = (total - copied).min(COPY_CHUNK as u64) as usize;
            let read = match reader.read(&mut buf[..want]) {
                Ok(0) => {
                    break Err(Error::device(
                        ErrorContext::new("read injected data").with_path(&path),
                        io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("source ended after {copied} of {total} bytes"),
                        ),
                    ));
                }
                Ok(read) => read,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    break Err(Error::device(
                        ErrorContext::new("read injected data").with_path(&path),
                        e,
                    ));
                }
            };
            if let Err(err) = self.write_entry_at(id, copied, &buf[..read]) {
                break Err(err);
            }
            copied += read as u64;
        };

        if let Err(err) = outcome {
            // Keep only what was copied; the rest of the chain may hold
            // stale data from earlier files.
            warn!("injecting {path} stopped after {copied} of {total} bytes");
            if let Err(shrink) = self.shrink_entry(id, copied) {
                warn!("could not cut {path} back to {copied} bytes: {shrink}");
            }
            return Err(err);
        }

        info!("injected {path} ({total} bytes)");
        Ok(id)
    }

    /// Streams a file's contents into `sink`; returns the byte count.
    pub fn extract_file<W: Write + ?Sized>(&mut self, id: EntryId, sink: &mut W) -> Result<u64, Error> {
        let path = self.entry(id)?.full_path();
        let mut buf = vec![0u8; COPY_CHUNK];
        let mut copied = 0u64;
        loop {
            let read = self.read_entry_at(id, copied, &mut buf)?;
            if read == 0 {
                break;
            }
            sink.write_all(&buf[..read]).map_err(|e| {
                Error::device(ErrorContext::new("write extracted data").with_path(&path), e)
            })?;
            copied += read as u64;
        }
        Ok(copied)
    }

    /// Mirrors an entry into the host directory `dest`: a file lands as
    /// `dest/<name>`, a directory's contents are recreated beneath
    /// `dest/<name>` (or directly in `dest` for a partition root). Returns
    /// the number of files written.
    pub fn extract_tree(&mut self, id: EntryId, dest: &Path) -> Result<usize, Error> {
        let host_error = |path: &Path, e: io::Error| {
            Error::device(
                ErrorContext::new("write host file").with_path(path.display().to_string()),
                e,
            )
        };

        self.subtree(id, "extract tree")?;
        let mut written = 0;
        let mut stack: Vec<(EntryId, PathBuf)> = vec![(id, dest.to_path_buf())];
        while let Some((current, target)) = stack.pop() {
            let entry = self.entry(current)?;
            let is_directory = entry.is_directory();
            let own_path = if entry.is_root() {
                target
            } else {
                target.join(entry.name())
            };

            if is_directory {
                fs::create_dir_all(&own_path).map_err(|e| host_error(&own_path, e))?;
                let children = self.get_child_file_entries(current)?;
                stack.extend(children.into_iter().rev().map(|child| (child, own_path.clone())));
            } else {
                let mut file = File::create(&own_path).map_err(|e| host_error(&own_path, e))?;
                self.extract_file(current, &mut file)?;
                written += 1;
            }
        }
        Ok(written)
    }

    /// Every live file at or below `id`, depth first in record order.
    pub fn collect_files(&mut self, id: EntryId) -> Result<Vec<EntryId>, Error> {
        let mut files = Vec::new();
        for current in self.subtree(id, "collect files")? {
            if !self.entry(current)?.is_directory() {
                files.push(current);
            }
        }
        Ok(files)
    }

    /// Resolves `[Drive:\]Partition\dir\file`, case-insensitively, with
    /// either separator.
    pub fn find(&mut self, path: &str) -> Result<EntryId, Error> {
        let relative = path.split_once(':').map_or(path, |(_, rest)| rest);
        let mut components = relative.split(['\\', '/']).filter(|c| !c.is_empty());
        let Some(partition_name) = components.next() else {
            return Err(Error::NotFound(format!("'{path}'")));
        };
        let partition = self
            .partition_by_name(partition_name)
            .ok_or_else(|| Error::NotFound(format!("partition '{partition_name}'")))?;

        let mut current = self.partitions[partition.0].root;
        for component in components {
            if !self.entry(current)?.is_directory() {
                return Err(Error::NotFound(format!("'{path}'")));
            }
            let children = self.get_child_file_entries(current)?;
            current = children
                .into_iter()
                .find(|child| {
                    lookup(&self.entries, *child)
                        .map(|entry| entry.name.eq_ignore_ascii_case(component))
                        .unwrap_or(false)
                })
                .ok_or_else(|| Error::NotFound(format!("'{path}'")))?;
        }
        Ok(current)
    }

    /// First four content bytes as a big-endian value; `None` for
    /// directories and files shorter than four bytes.
    pub fn file_magic(&mut self, id: EntryId) -> Result<Option<u32>, Error> {
        let entry = lookup(&self.entries, id)?;
        if let Some(magic) = entry.magic.get() {
            return Ok(*magic);
        }
        let magic = if entry.is_directory() || entry.file_size < 4 {
            None
        } else {
            let mut bytes = [0u8; 4];
            self.read_entry_at(id, 0, &mut bytes)?;
            Some(u32::from_be_bytes(bytes))
        };
        lookup_mut(&mut self.entries, id)?.magic = Cache::Resolved(magic);
        Ok(magic)
    }

    /// Name the console gave the drive, stored as UTF-16 in
    /// `Content\name.txt`.
    pub fn drive_name(&mut self) -> Result<Option<String>, Error> {
        let id = match self.find(DRIVE_NAME_PATH) {
            Ok(id) => id,
            Err(Error::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        let entry = self.entry(id)?;
        if entry.is_directory() || entry.file_size < 2 {
            return Ok(None);
        }
        let chars = ((entry.file_size - 2) / 2).min(DRIVE_NAME_MAX_CHARS) as usize;

        let read_error =
            |e: io::Error| Error::device(ErrorContext::new("read drive name").with_path(DRIVE_NAME_PATH), e);
        let mut stream = self.stream(id)?;
        if stream.read_u16::<BigEndian>().map_err(read_error)? != UTF16_BOM {
            return Ok(None);
        }
        Ok(Some(stream.read_wstring(chars).map_err(read_error)?))
    }

    fn read_security_blob_bytes(&mut self) -> Result<Vec<u8>, Error> {
        let Some(range) = self.layout.security_blob.clone() else {
            return Err(Error::NotFound(
                "security blob range in the device layout".to_string(),
            ));
        };
        let mut bytes = vec![0u8; range.size as usize];
        self.device.read_at(range.offset, &mut bytes).map_err(|e| {
            Error::device(ErrorContext::at("read security blob", range.offset), e)
        })?;
        Ok(bytes)
    }

    /// Copies the raw security blob to `sink`; no cluster chain is involved.
    pub fn extract_security_blob<W: Write + ?Sized>(&mut self, sink: &mut W) -> Result<u64, Error> {
        let bytes = self.read_security_blob_bytes()?;
        sink.write_all(&bytes)
            .map_err(|e| Error::device(ErrorContext::new("write security blob"), e))?;
        Ok(bytes.len() as u64)
    }

    pub fn extract_security_blob_to(&mut self, path: &Path) -> Result<u64, Error> {
        let mut file = File::create(path).map_err(|e| {
            Error::device(
                ErrorContext::new("create security blob file").with_path(path.display().to_string()),
                e,
            )
        })?;
        self.extract_security_blob(&mut file)
    }

    pub fn security_blob(&mut self) -> Result<SecurityBlob, Error> {
        let bytes = self.read_security_blob_bytes()?;
        Ok(SecurityBlob::parse(&bytes)?)
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        self.device
            .flush()
            .map_err(|e| Error::device(ErrorContext::new("flush device"), e))
    }

    /// Flushes and hands the device back.
    pub fn into_device(mut self) -> Result<D, Error> {
        self.flush()?;
        Ok(self.device)
    }

    pub fn close(self) -> Result<(), Error> {
        self.into_device().map(drop)
    }
}
