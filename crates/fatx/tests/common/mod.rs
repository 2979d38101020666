#![allow(dead_code)]

use fatx::format::format_slot;
use fatx::{DeviceLayout, EntryId, FatxVolume, MemoryDevice, PartitionId};

pub const DEVICE_LEN: usize = 0x40_0000;
pub const SECTORS_PER_CLUSTER: u32 = 8;
pub const CLUSTER_SIZE: u64 = 0x1000;
pub const BLOB_OFFSET: usize = 0x2000;

const LAYOUT: &str = r#"
[security_blob]
offset = 0x2000
size = 0x228

[[partition]]
name = "System"
offset = 0x10000
size = 0x100000

[[partition]]
name = "Content"
offset = 0x110000
"#;

pub fn test_layout() -> DeviceLayout {
    DeviceLayout::from_toml_str(LAYOUT).expect("test layout")
}

/// A device with only the named slots formatted.
pub fn device_with(slots: &[&str]) -> MemoryDevice {
    let layout = test_layout();
    let mut device = MemoryDevice::zeroed(DEVICE_LEN);
    for (index, name) in slots.iter().enumerate() {
        let slot = layout.slot(name).expect("slot in layout");
        format_slot(&mut device, slot, SECTORS_PER_CLUSTER, 0x1000 + index as u32)
            .expect("format slot");
    }
    device
}

pub fn mount(device: MemoryDevice) -> FatxVolume<MemoryDevice> {
    FatxVolume::from_device(device, test_layout()).expect("mount device")
}

pub fn fresh_volume() -> FatxVolume<MemoryDevice> {
    mount(device_with(&["System", "Content"]))
}

pub fn content(volume: &FatxVolume<MemoryDevice>) -> PartitionId {
    volume.partition_by_name("Content").expect("content partition")
}

pub fn content_root(volume: &FatxVolume<MemoryDevice>) -> EntryId {
    let id = content(volume);
    volume.partition(id).expect("partition").root()
}

pub fn child_names(volume: &mut FatxVolume<MemoryDevice>, dir: EntryId) -> Vec<String> {
    let children = volume.get_child_file_entries(dir).expect("list directory");
    children
        .into_iter()
        .map(|id| volume.entry(id).expect("entry").name().to_string())
        .collect()
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
}
