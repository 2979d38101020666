//! Partition header decoding and the geometry derived from it.

use byteorder::{BigEndian, ByteOrder};
use log::debug;

use crate::device::BlockDevice;
use crate::entry::EntryId;
use crate::error::{Error, ErrorContext};
use crate::fat::FatTable;
use crate::layout::PartitionSlot;

pub const FATX_MAGIC: [u8; 4] = *b"FATX";
pub const BOOT_SECTOR_LEN: usize = 16;
pub const SECTOR_SIZE: u64 = 0x200;
/// Bytes reserved for the boot sector ahead of the FAT.
pub const BOOT_REGION_SIZE: u64 = 0x1000;
pub const FAT_ALIGNMENT: u64 = 0x1000;
/// Partitions with fewer clusters than this use a 16 bit FAT.
pub const FAT16_CLUSTER_LIMIT: u64 = 0xFFF0;
pub const MAX_SECTORS_PER_CLUSTER: u32 = 0x100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionId(pub(crate) usize);

impl PartitionId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatWidth {
    Fat16,
    Fat32,
}

impl FatWidth {
    pub fn for_cluster_count(cluster_count: u64) -> Self {
        if cluster_count < FAT16_CLUSTER_LIMIT {
            FatWidth::Fat16
        } else {
            FatWidth::Fat32
        }
    }

    pub const fn bytes(self) -> u64 {
        match self {
            FatWidth::Fat16 => 2,
            FatWidth::Fat32 => 4,
        }
    }
}

/// The four header fields at the start of every partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootSector {
    pub serial: u32,
    pub sectors_per_cluster: u32,
    pub root_dir_first_cluster: u32,
}

impl BootSector {
    /// Returns `None` when the magic is absent, which marks an unused slot.
    pub fn parse(bytes: &[u8; BOOT_SECTOR_LEN]) -> Option<Self> {
        if bytes[0..4] != FATX_MAGIC {
            return None;
        }
        Some(Self {
            serial: BigEndian::read_u32(&bytes[4..8]),
            sectors_per_cluster: BigEndian::read_u32(&bytes[8..12]),
            root_dir_first_cluster: BigEndian::read_u32(&bytes[12..16]),
        })
    }

    pub fn to_bytes(&self) -> [u8; BOOT_SECTOR_LEN] {
        let mut out = [0u8; BOOT_SECTOR_LEN];
        out[0..4].copy_from_slice(&FATX_MAGIC);
        BigEndian::write_u32(&mut out[4..8], self.serial);
        BigEndian::write_u32(&mut out[8..12], self.sectors_per_cluster);
        BigEndian::write_u32(&mut out[12..16], self.root_dir_first_cluster);
        out
    }
}

/// Region layout of one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub cluster_size: u64,
    pub cluster_count: u32,
    pub fat_width: FatWidth,
    pub fat_offset: u64,
    /// Padded length of the FAT region.
    pub fat_size: u64,
    pub data_offset: u64,
}

impl Geometry {
    pub fn derive(offset: u64, size: u64, sectors_per_cluster: u32) -> Result<Self, String> {
        if sectors_per_cluster == 0
            || !sectors_per_cluster.is_power_of_two()
            || sectors_per_cluster > MAX_SECTORS_PER_CLUSTER
        {
            return Err(format!(
                "invalid sectors per cluster {sectors_per_cluster:#x}"
            ));
        }
        let cluster_size = u64::from(sectors_per_cluster) * SECTOR_SIZE;

        if size <= BOOT_REGION_SIZE {
            return Err(format!("partition of {size:#x} bytes is too small"));
        }
        let usable = size - BOOT_REGION_SIZE;

        // The FAT is sized for every cluster that could fit without it; the
        // clusters it displaces are then dropped from the count.
        let estimate = usable / cluster_size;
        if estimate >= u64::from(u32::MAX - 0x10) {
            return Err(format!("partition of {size:#x} bytes has too many clusters"));
        }
        let fat_size = align_up(
            (estimate + 1) * FatWidth::for_cluster_count(estimate).bytes(),
            FAT_ALIGNMENT,
        );
        if fat_size >= usable {
            return Err(format!("partition of {size:#x} bytes has no data region"));
        }
        let cluster_count = (usable - fat_size) / cluster_size;
        if cluster_count == 0 {
            return Err(format!("partition of {size:#x} bytes holds no clusters"));
        }

        let fat_offset = offset + BOOT_REGION_SIZE;
        Ok(Self {
            cluster_size,
            cluster_count: cluster_count as u32,
            fat_width: FatWidth::for_cluster_count(cluster_count),
            fat_offset,
            fat_size,
            data_offset: fat_offset + fat_size,
        })
    }
}

pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

#[derive(Debug)]
pub struct Partition {
    pub name: String,
    pub offset: u64,
    pub size: u64,
    pub serial: u32,
    pub sectors_per_cluster: u32,
    pub root_dir_first_cluster: u32,
    pub cluster_size: u64,
    pub cluster_count: u32,
    pub fat_width: FatWidth,
    pub fat_offset: u64,
    pub data_offset: u64,
    pub(crate) root: EntryId,
    pub(crate) table: Option<FatTable>,
}

impl Partition {
    pub fn root(&self) -> EntryId {
        self.root
    }

    pub fn total_bytes(&self) -> u64 {
        u64::from(self.cluster_count) * self.cluster_size
    }

    /// Byte offset of the FAT slot describing `cluster`.
    pub fn fat_slot_offset(&self, cluster: u32) -> u64 {
        self.fat_offset + u64::from(cluster) * self.fat_width.bytes()
    }

    pub fn is_data_cluster(&self, cluster: u32) -> bool {
        cluster >= 1 && cluster <= self.cluster_count
    }
}

/// Reads the boot sector of `slot`. `Ok(None)` means the slot is unused: it
/// either does not fit on the device or carries no magic.
pub fn parse_partition<D: BlockDevice + ?Sized>(
    device: &mut D,
    slot: &PartitionSlot,
    device_len: u64,
    root: EntryId,
) -> Result<Option<Partition>, Error> {
    let Some(size) = slot.size_on(device_len) else {
        debug!("slot {} at {:#x} is beyond the device", slot.name, slot.offset);
        return Ok(None);
    };

    let mut raw = [0u8; BOOT_SECTOR_LEN];
    device
        .read_at(slot.offset, &mut raw)
        .map_err(|e| Error::device(ErrorContext::at("read boot sector", slot.offset), e))?;

    let Some(boot) = BootSector::parse(&raw) else {
        debug!("slot {} at {:#x} has no FATX magic", slot.name, slot.offset);
        return Ok(None);
    };

    let context = || ErrorContext::at("parse boot sector", slot.offset).with_path(&slot.name);
    let geometry = Geometry::derive(slot.offset, size, boot.sectors_per_cluster)
        .map_err(|reason| Error::format(context(), reason))?;

    if boot.root_dir_first_cluster == 0
        || boot.root_dir_first_cluster > geometry.cluster_count
    {
        return Err(Error::format(
            context(),
            format!(
                "root directory cluster {} outside 1..={}",
                boot.root_dir_first_cluster, geometry.cluster_count
            ),
        ));
    }

    debug!(
        "slot {}: {} clusters of {:#x} bytes, {:?}",
        slot.name, geometry.cluster_count, geometry.cluster_size, geometry.fat_width
    );

    Ok(Some(Partition {
        name: slot.name.clone(),
        offset: slot.offset,
        size,
        serial: boot.serial,
        sectors_per_cluster: boot.sectors_per_cluster,
        root_dir_first_cluster: boot.root_dir_first_cluster,
        cluster_size: geometry.cluster_size,
        cluster_count: geometry.cluster_count,
        fat_width: geometry.fat_width,
        fat_offset: geometry.fat_offset,
        data_offset: geometry.data_offset,
        root,
        table: None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;

    fn slot(offset: u64, size: Option<u64>) -> PartitionSlot {
        PartitionSlot {
            name: "Test".to_string(),
            offset,
            size,
        }
    }

    #[test]
    fn geometry_keeps_clusters_inside_partition() {
        for (size, spc) in [
            (0x10_0000u64, 1u32),
            (0x40_0000, 8),
            (0x1000_0000, 32),
            (0x2_0000_0000, 32),
        ] {
            let geometry = Geometry::derive(0x8000, size, spc).expect("geometry");
            let data_end =
                geometry.data_offset + u64::from(geometry.cluster_count) * geometry.cluster_size;
            assert!(data_end <= 0x8000 + size, "data region overflows for {size:#x}");
            assert!(u64::from(geometry.cluster_count) * geometry.cluster_size <= size);
            assert_eq!(geometry.fat_offset, 0x8000 + BOOT_REGION_SIZE);
            assert_eq!(geometry.fat_size % FAT_ALIGNMENT, 0);
            let slots = (u64::from(geometry.cluster_count) + 1) * geometry.fat_width.bytes();
            assert!(slots <= geometry.fat_size);
        }
    }

    #[test]
    fn fat_width_follows_cluster_count() {
        let small = Geometry::derive(0, 0x100_0000, 1).expect("geometry");
        assert!(u64::from(small.cluster_count) < FAT16_CLUSTER_LIMIT);
        assert_eq!(small.fat_width, FatWidth::Fat16);

        let large = Geometry::derive(0, 0x1000_0000, 1).expect("geometry");
        assert!(u64::from(large.cluster_count) >= FAT16_CLUSTER_LIMIT);
        assert_eq!(large.fat_width, FatWidth::Fat32);
    }

    #[test]
    fn invalid_sectors_per_cluster_are_rejected() {
        assert!(Geometry::derive(0, 0x10_0000, 0).is_err());
        assert!(Geometry::derive(0, 0x10_0000, 3).is_err());
        assert!(Geometry::derive(0, 0x10_0000, 0x200).is_err());
    }

    #[test]
    fn missing_magic_is_an_unused_slot() {
        let mut device = MemoryDevice::zeroed(0x2_0000);
        let parsed =
            parse_partition(&mut device, &slot(0x1000, None), 0x2_0000, EntryId(0)).expect("parse partition");
        assert!(parsed.is_none());
    }

    #[test]
    fn slot_beyond_device_is_unused() {
        let mut device = MemoryDevice::zeroed(0x1000);
        let parsed =
            parse_partition(&mut device, &slot(0x4000, None), 0x1000, EntryId(0)).expect("parse partition");
        assert!(parsed.is_none());
    }

    #[test]
    fn decodes_header_fields() {
        let mut device = MemoryDevice::zeroed(0x10_0000);
        let boot = BootSector {
            serial: 0xDEAD_BEEF,
            sectors_per_cluster: 8,
            root_dir_first_cluster: 1,
        };
        device.write_at(0, &boot.to_bytes()).expect("write boot sector");

        let partition = parse_partition(&mut device, &slot(0, None), 0x10_0000, EntryId(3))
            .expect("parse partition")
            .expect("partition");
        assert_eq!(partition.serial, 0xDEAD_BEEF);
        assert_eq!(partition.cluster_size, 0x1000);
        assert_eq!(partition.root_dir_first_cluster, 1);
        assert_eq!(partition.fat_offset, BOOT_REGION_SIZE);
        assert_eq!(partition.root(), EntryId(3));
        assert_eq!(partition.data_offset % FAT_ALIGNMENT, 0);
    }

    #[test]
    fn root_cluster_out_of_range_is_a_format_error() {
        let mut device = MemoryDevice::zeroed(0x10_0000);
        let boot = BootSector {
            serial: 1,
            sectors_per_cluster: 8,
            root_dir_first_cluster: 0,
        };
        device.write_at(0, &boot.to_bytes()).expect("write boot sector");
        let result = parse_partition(&mut device, &slot(0, None), 0x10_0000, EntryId(0));
        assert!(matches!(result, Err(Error::Format { .. })));
    }
}
