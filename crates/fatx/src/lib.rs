//! Driver for the FATX filesystem found on console hard drives and memory
//! units.
//!
//! [`FatxVolume`] is the entry point: it scans the fixed partition slots of a
//! [`DeviceLayout`], decodes directories on demand and reads or writes file
//! contents through [`FatxStream`]. The raw device is reached only through the
//! [`BlockDevice`] trait, so image files, physical drives and in-memory buffers
//! all work the same way.

pub mod bitmap;
pub mod boot_sector;
pub mod device;
pub mod dir_entry;
pub mod entry;
mod error;
pub mod fat;
pub mod format;
pub mod layout;
pub mod stream;
pub mod volume;

pub use boot_sector::{FatWidth, Partition, PartitionId};
pub use device::{BlockDevice, FileDevice, MemoryDevice};
pub use dir_entry::{Attributes, DirRecord, NameStatus};
pub use entry::{EntryId, FileEntry, NewEntry};
pub use error::{Error, ErrorContext};
pub use layout::{DeviceLayout, PartitionSlot, SecurityBlobRange};
pub use stream::FatxStream;
pub use volume::{FatxVolume, SlotOutcome, SlotReport};
pub use xbox_filetypes::PackedTimestamp;
