use std::collections::HashSet;
use std::path::Path;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::Error;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct SecurityBlobRange {
    pub offset: u64,
    pub size: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct PartitionSlot {
    pub name: String,
    pub offset: u64,
    /// `None` means the slot extends to the end of the device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl PartitionSlot {
    /// Byte size of this slot on a device of `device_len` bytes, or `None` if
    /// the slot does not fit on the device at all.
    pub fn size_on(&self, device_len: u64) -> Option<u64> {
        if self.offset >= device_len {
            return None;
        }
        let available = device_len - self.offset;
        match self.size {
            Some(size) if size <= available => Some(size),
            Some(_) => None,
            None => Some(available),
        }
    }
}

/// Fixed on-device locations scanned when a volume is opened.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct DeviceLayout {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_blob: Option<SecurityBlobRange>,
    #[serde(rename = "partition", default)]
    pub partitions: Vec<PartitionSlot>,
}

static XBOX360_HDD: Lazy<DeviceLayout> = Lazy::new(|| {
    toml::from_str(include_str!("layouts/xbox360_hdd.toml")).expect("valid built-in layout")
});

impl DeviceLayout {
    pub fn xbox360_hdd() -> &'static DeviceLayout {
        &XBOX360_HDD
    }

    pub fn from_toml_str(text: &str) -> Result<Self, Error> {
        let layout = toml::from_str::<DeviceLayout>(text)
            .map_err(|e| Error::InvalidArgument(format!("device layout: {e}")))?;
        layout.validate()?;
        Ok(layout)
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidArgument(format!("cannot read layout {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.partitions.is_empty() {
            return Err(Error::InvalidArgument(
                "device layout must list at least one partition".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for slot in &self.partitions {
            let name = slot.name.trim();
            if name.is_empty() {
                return Err(Error::InvalidArgument(
                    "partition slot names must not be empty".to_string(),
                ));
            }
            if !seen.insert(name.to_ascii_lowercase()) {
                return Err(Error::InvalidArgument(format!(
                    "partition slot '{name}' is listed twice"
                )));
            }
            if slot.size == Some(0) {
                return Err(Error::InvalidArgument(format!(
                    "partition slot '{name}' has zero size"
                )));
            }
        }

        if let Some(blob) = &self.security_blob {
            if blob.size == 0 {
                return Err(Error::InvalidArgument(
                    "security blob size must not be zero".to_string(),
                ));
            }
        }

        Ok(())
    }

    pub fn slot(&self, name: &str) -> Option<&PartitionSlot> {
        self.partitions
            .iter()
            .find(|slot| slot.name.eq_ignore_ascii_case(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_in_layout_is_valid() {
        let layout = DeviceLayout::xbox360_hdd();
        layout.validate().expect("valid layout");
        assert_eq!(layout.partitions.len(), 6);
        let content = layout.slot("content").expect("content slot");
        assert_eq!(content.offset, 0x1_30EB_0000);
        assert_eq!(content.size, None);
        assert_eq!(
            layout.security_blob,
            Some(SecurityBlobRange {
                offset: 0x2000,
                size: 0x228
            })
        );
    }

    #[test]
    fn toml_round_trip_preserves_layout() {
        let layout = DeviceLayout::xbox360_hdd();
        let text = layout.to_toml_string().expect("serialize");
        let reparsed = DeviceLayout::from_toml_str(&text).expect("reparse");
        assert_eq!(&reparsed, layout);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let text = r#"
            [[partition]]
            name = "Data"
            offset = 0x1000

            [[partition]]
            name = "DATA"
            offset = 0x2000
        "#;
        assert!(matches!(
            DeviceLayout::from_toml_str(text),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn slot_size_depends_on_device() {
        let fixed = PartitionSlot {
            name: "Fixed".to_string(),
            offset: 0x1000,
            size: Some(0x2000),
        };
        assert_eq!(fixed.size_on(0x3000), Some(0x2000));
        assert_eq!(fixed.size_on(0x2FFF), None);

        let open_ended = PartitionSlot {
            name: "Rest".to_string(),
            offset: 0x1000,
            size: None,
        };
        assert_eq!(open_ended.size_on(0x5000), Some(0x4000));
        assert_eq!(open_ended.size_on(0x1000), None);
    }
}
