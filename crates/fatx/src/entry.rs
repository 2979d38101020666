use xbox_filetypes::PackedTimestamp;

use crate::boot_sector::PartitionId;
use crate::dir_entry::{Attributes, DirRecord, NameStatus};

/// Handle to a file or directory of an open volume. Handles of deleted or
/// invalidated entries resolve to `NotFound`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub(crate) usize);

impl EntryId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Value derived from the device on first use and kept until a mutation
/// or an explicit invalidation drops it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Cache<T> {
    Unresolved,
    Resolved(T),
}

impl<T> Default for Cache<T> {
    fn default() -> Self {
        Cache::Unresolved
    }
}

impl<T> Cache<T> {
    pub(crate) fn get(&self) -> Option<&T> {
        match self {
            Cache::Resolved(value) => Some(value),
            Cache::Unresolved => None,
        }
    }

    pub(crate) fn get_mut(&mut self) -> Option<&mut T> {
        match self {
            Cache::Resolved(value) => Some(value),
            Cache::Unresolved => None,
        }
    }

    pub(crate) fn take(&mut self) -> Option<T> {
        match std::mem::take(self) {
            Cache::Resolved(value) => Some(value),
            Cache::Unresolved => None,
        }
    }
}

/// Decoded contents of one directory's record area.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct DirectoryListing {
    /// Live children in record order.
    pub(crate) children: Vec<EntryId>,
    /// Unused and deleted record slots before the end marker, ascending.
    pub(crate) free_slots: Vec<u32>,
    /// Slot holding the end-of-directory marker, if one was found.
    pub(crate) end_slot: Option<u32>,
    /// Records that fit in the directory's current cluster chain.
    pub(crate) capacity: u32,
}

impl DirectoryListing {
    /// Slot a new record should go into, preferring reuse over appending.
    pub(crate) fn next_slot(&self) -> u32 {
        self.free_slots
            .first()
            .copied()
            .or(self.end_slot)
            .unwrap_or(self.capacity)
    }

    pub(crate) fn claim(&mut self, slot: u32) {
        if let Some(position) = self.free_slots.iter().position(|s| *s == slot) {
            self.free_slots.remove(position);
        } else if self.end_slot == Some(slot) {
            self.end_slot = (slot + 1 < self.capacity).then_some(slot + 1);
        }
    }

    pub(crate) fn release(&mut self, slot: u32) {
        if let Err(position) = self.free_slots.binary_search(&slot) {
            self.free_slots.insert(position, slot);
        }
    }
}

/// What to create with `FatxVolume::create_file_entry`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    pub name: String,
    pub attributes: Attributes,
    /// Ignored for directories.
    pub file_size: u32,
    pub created: PackedTimestamp,
    pub modified: PackedTimestamp,
    pub accessed: PackedTimestamp,
}

impl NewEntry {
    pub fn file(name: impl Into<String>, file_size: u32) -> Self {
        let now = PackedTimestamp::now();
        Self {
            name: name.into(),
            attributes: Attributes::default(),
            file_size,
            created: now,
            modified: now,
            accessed: now,
        }
    }

    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            attributes: Attributes::DIRECTORY,
            ..Self::file(name, 0)
        }
    }

    pub fn with_timestamps(mut self, timestamp: PackedTimestamp) -> Self {
        self.created = timestamp;
        self.modified = timestamp;
        self.accessed = timestamp;
        self
    }

    pub fn is_directory(&self) -> bool {
        self.attributes.is_directory()
    }
}

#[derive(Debug, Clone)]
pub struct FileEntry {
    pub(crate) name: String,
    pub(crate) attributes: Attributes,
    pub(crate) first_cluster: u32,
    pub(crate) file_size: u32,
    pub(crate) created: PackedTimestamp,
    pub(crate) modified: PackedTimestamp,
    pub(crate) accessed: PackedTimestamp,
    pub(crate) partition: PartitionId,
    pub(crate) parent: Option<EntryId>,
    /// Full path of the parent; for a partition root, the partition name.
    pub(crate) path: String,
    /// Record index inside the parent directory. `None` for roots.
    pub(crate) slot: Option<u32>,
    pub(crate) children: Cache<DirectoryListing>,
    pub(crate) chain: Cache<Vec<u32>>,
    pub(crate) magic: Cache<Option<u32>>,
}

impl FileEntry {
    pub(crate) fn root(partition: PartitionId, name: &str, first_cluster: u32) -> Self {
        Self {
            name: String::new(),
            attributes: Attributes::DIRECTORY,
            first_cluster,
            file_size: 0,
            created: PackedTimestamp::default(),
            modified: PackedTimestamp::default(),
            accessed: PackedTimestamp::default(),
            partition,
            parent: None,
            path: name.to_string(),
            slot: None,
            children: Cache::Unresolved,
            chain: Cache::Unresolved,
            magic: Cache::Unresolved,
        }
    }

    pub(crate) fn from_record(
        record: DirRecord,
        partition: PartitionId,
        parent: EntryId,
        path: String,
        slot: u32,
    ) -> Self {
        Self {
            name: record.name,
            attributes: record.attributes,
            first_cluster: record.first_cluster,
            file_size: if record.attributes.is_directory() {
                0
            } else {
                record.file_size
            },
            created: record.created,
            modified: record.modified,
            accessed: record.accessed,
            partition,
            parent: Some(parent),
            path,
            slot: Some(slot),
            children: Cache::Unresolved,
            chain: Cache::Unresolved,
            magic: Cache::Unresolved,
        }
    }

    pub(crate) fn to_record(&self) -> DirRecord {
        DirRecord {
            status: NameStatus::Valid(self.name.len() as u8),
            name: self.name.clone(),
            attributes: self.attributes,
            first_cluster: self.first_cluster,
            file_size: self.file_size,
            created: self.created,
            modified: self.modified,
            accessed: self.accessed,
        }
    }

    /// Empty for partition roots.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attributes(&self) -> Attributes {
        self.attributes
    }

    pub fn is_directory(&self) -> bool {
        self.attributes.is_directory()
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn first_cluster(&self) -> u32 {
        self.first_cluster
    }

    /// Always 0 for directories.
    pub fn file_size(&self) -> u32 {
        self.file_size
    }

    pub fn created(&self) -> PackedTimestamp {
        self.created
    }

    pub fn modified(&self) -> PackedTimestamp {
        self.modified
    }

    pub fn accessed(&self) -> PackedTimestamp {
        self.accessed
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn parent(&self) -> Option<EntryId> {
        self.parent
    }

    /// Logical path of the containing directory.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn full_path(&self) -> String {
        if self.name.is_empty() {
            self.path.clone()
        } else {
            format!("{}\\{}", self.path, self.name)
        }
    }

    /// Cluster chain, if it has been resolved since the last invalidation.
    pub fn cached_chain(&self) -> Option<&[u32]> {
        self.chain.get().map(Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(free_slots: Vec<u32>, end_slot: Option<u32>, capacity: u32) -> DirectoryListing {
        DirectoryListing {
            children: Vec::new(),
            free_slots,
            end_slot,
            capacity,
        }
    }

    #[test]
    fn next_slot_prefers_reuse() {
        assert_eq!(listing(vec![3, 5], Some(8), 64).next_slot(), 3);
        assert_eq!(listing(vec![], Some(8), 64).next_slot(), 8);
        assert_eq!(listing(vec![], None, 64).next_slot(), 64);
    }

    #[test]
    fn claiming_end_slot_moves_marker() {
        let mut dir = listing(vec![], Some(62), 64);
        dir.claim(62);
        assert_eq!(dir.end_slot, Some(63));
        dir.claim(63);
        assert_eq!(dir.end_slot, None);
        assert_eq!(dir.next_slot(), 64);
    }

    #[test]
    fn released_slots_stay_sorted() {
        let mut dir = listing(vec![2, 9], Some(10), 64);
        dir.release(4);
        dir.release(4);
        assert_eq!(dir.free_slots, vec![2, 4, 9]);
        dir.claim(2);
        assert_eq!(dir.free_slots, vec![4, 9]);
    }

    #[test]
    fn paths_join_with_backslash() {
        let root = FileEntry::root(PartitionId(0), "Content", 1);
        assert_eq!(root.full_path(), "Content");
        assert!(root.is_root() && root.is_directory());

        let record = DirRecord {
            status: NameStatus::Valid(4),
            name: "Apps".to_string(),
            attributes: Attributes::DIRECTORY,
            first_cluster: 2,
            file_size: 123,
            created: PackedTimestamp::default(),
            modified: PackedTimestamp::default(),
            accessed: PackedTimestamp::default(),
        };
        let child = FileEntry::from_record(record, PartitionId(0), EntryId(0), root.full_path(), 0);
        assert_eq!(child.full_path(), "Content\\Apps");
        assert_eq!(child.file_size(), 0);
    }
}
