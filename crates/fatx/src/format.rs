//! Writes an empty FATX partition: boot sector, cleared allocation table and
//! a root directory of one cluster.

use byteorder::{BigEndian, ByteOrder};
use log::info;

use crate::boot_sector::{BootSector, FatWidth, Geometry, BOOT_REGION_SIZE};
use crate::device::BlockDevice;
use crate::error::{Error, ErrorContext};
use crate::layout::PartitionSlot;

pub const ROOT_DIR_CLUSTER: u32 = 1;
pub const DEFAULT_SECTORS_PER_CLUSTER: u32 = 32;

const ZERO_CHUNK: usize = 0x1_0000;
/// Value stored in the reserved slot 0.
const MEDIA_DESCRIPTOR: u32 = 0xFFFF_FFF8;

fn write_all<D: BlockDevice + ?Sized>(device: &mut D, offset: u64, data: &[u8]) -> Result<(), Error> {
    let written = device
        .write_at(offset, data)
        .map_err(|e| Error::device(ErrorContext::at("format partition", offset), e))?;
    if written != data.len() {
        return Err(Error::device(
            ErrorContext::at("format partition", offset),
            std::io::Error::new(std::io::ErrorKind::WriteZero, "short write"),
        ));
    }
    Ok(())
}

/// Formats `size` bytes at `offset`. Everything previously stored in the
/// partition becomes unreachable.
pub fn format_partition<D: BlockDevice + ?Sized>(
    device: &mut D,
    offset: u64,
    size: u64,
    sectors_per_cluster: u32,
    serial: u32,
) -> Result<Geometry, Error> {
    let geometry = Geometry::derive(offset, size, sectors_per_cluster)
        .map_err(|reason| Error::InvalidArgument(format!("cannot format: {reason}")))?;

    let boot = BootSector {
        serial,
        sectors_per_cluster,
        root_dir_first_cluster: ROOT_DIR_CLUSTER,
    };
    let mut boot_region = vec![0u8; BOOT_REGION_SIZE as usize];
    boot_region[..boot.to_bytes().len()].copy_from_slice(&boot.to_bytes());
    write_all(device, offset, &boot_region)?;

    let zeros = vec![0u8; ZERO_CHUNK];
    let mut cleared = 0u64;
    while cleared < geometry.fat_size {
        let len = (geometry.fat_size - cleared).min(ZERO_CHUNK as u64) as usize;
        write_all(device, geometry.fat_offset + cleared, &zeros[..len])?;
        cleared += len as u64;
    }

    // Slot 0 holds the media descriptor, the root cluster ends its chain.
    let mut head = [0u8; 8];
    let head_len = match geometry.fat_width {
        FatWidth::Fat16 => {
            BigEndian::write_u16(&mut head[0..2], MEDIA_DESCRIPTOR as u16);
            BigEndian::write_u16(&mut head[2..4], 0xFFFF);
            4
        }
        FatWidth::Fat32 => {
            BigEndian::write_u32(&mut head[0..4], MEDIA_DESCRIPTOR);
            BigEndian::write_u32(&mut head[4..8], 0xFFFF_FFFF);
            8
        }
    };
    write_all(device, geometry.fat_offset, &head[..head_len])?;

    let root = vec![0xFFu8; geometry.cluster_size as usize];
    write_all(device, geometry.data_offset, &root)?;

    device
        .flush()
        .map_err(|e| Error::device(ErrorContext::at("format partition", offset), e))?;
    info!(
        "formatted {:#x} bytes at {offset:#x}: {} clusters of {:#x} bytes",
        size, geometry.cluster_count, geometry.cluster_size
    );
    Ok(geometry)
}

/// Formats one layout slot of a device, sized the way a mount would size it.
pub fn format_slot<D: BlockDevice + ?Sized>(
    device: &mut D,
    slot: &PartitionSlot,
    sectors_per_cluster: u32,
    serial: u32,
) -> Result<Geometry, Error> {
    let device_len = device
        .len()
        .map_err(|e| Error::device(ErrorContext::new("query device size"), e))?;
    let size = slot.size_on(device_len).ok_or_else(|| {
        Error::InvalidArgument(format!(
            "slot {} at {:#x} does not fit on a {device_len:#x} byte device",
            slot.name, slot.offset
        ))
    })?;
    format_partition(device, slot.offset, size, sectors_per_cluster, serial)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot_sector::{parse_partition, FATX_MAGIC};
    use crate::device::MemoryDevice;
    use crate::entry::EntryId;

    #[test]
    fn formatted_partition_mounts_with_empty_root() {
        let mut device = MemoryDevice::zeroed(0x40_0000);
        let geometry = format_partition(&mut device, 0x1_0000, 0x20_0000, 8, 0xCAFE).expect("format");
        assert_eq!(&device.as_bytes()[0x1_0000..0x1_0004], &FATX_MAGIC);

        let slot = PartitionSlot {
            name: "Data".to_string(),
            offset: 0x1_0000,
            size: Some(0x20_0000),
        };
        let partition = parse_partition(&mut device, &slot, 0x40_0000, EntryId(0))
            .expect("parse partition")
            .expect("partition");
        assert_eq!(partition.serial, 0xCAFE);
        assert_eq!(partition.cluster_count, geometry.cluster_count);
        assert_eq!(partition.data_offset, geometry.data_offset);

        let root = &device.as_bytes()[geometry.data_offset as usize..][..0x1000];
        assert!(root.iter().all(|b| *b == 0xFF));
        let fat = &device.as_bytes()[geometry.fat_offset as usize..];
        assert_eq!(&fat[2..4], &[0xFF, 0xFF]);
        assert!(fat[4..geometry.fat_size as usize].iter().all(|b| *b == 0));
    }

    #[test]
    fn stale_allocation_table_is_cleared() {
        let mut device = MemoryDevice::new(vec![0xAB; 0x20_0000]);
        let geometry = format_partition(&mut device, 0, 0x20_0000, 1, 1).expect("format");
        let fat = &device.as_bytes()[geometry.fat_offset as usize..];
        assert!(fat[4..geometry.fat_size as usize].iter().all(|b| *b == 0));
    }

    #[test]
    fn slot_must_fit_device() {
        let mut device = MemoryDevice::zeroed(0x1_0000);
        let slot = PartitionSlot {
            name: "Far".to_string(),
            offset: 0x10_0000,
            size: None,
        };
        assert!(matches!(
            format_slot(&mut device, &slot, 8, 1),
            Err(Error::InvalidArgument(_))
        ));
    }
}
