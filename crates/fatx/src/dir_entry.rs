//! The 64 byte on-disk directory record.

use byteorder::{BigEndian, ByteOrder};
use xbox_filetypes::PackedTimestamp;

use crate::Error;

pub const DIR_RECORD_SIZE: usize = 64;
pub const MAX_NAME_LEN: usize = 42;

const STATUS_UNUSED: u8 = 0x00;
const STATUS_DELETED: u8 = 0xE5;
const STATUS_END: u8 = 0xFF;
const NAME_PADDING: u8 = 0xFF;
const FORBIDDEN_NAME_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Attributes(u8);

impl Attributes {
    pub const READ_ONLY: Attributes = Attributes(0x01);
    pub const HIDDEN: Attributes = Attributes(0x02);
    pub const SYSTEM: Attributes = Attributes(0x04);
    pub const DIRECTORY: Attributes = Attributes(0x10);
    pub const ARCHIVE: Attributes = Attributes(0x20);
    pub const DEVICE: Attributes = Attributes(0x40);

    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Attributes) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Attributes) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn is_directory(self) -> bool {
        self.contains(Self::DIRECTORY)
    }

    /// `drhsa`-style summary used by listings.
    pub fn describe(self) -> String {
        [
            (Self::DIRECTORY, 'd'),
            (Self::READ_ONLY, 'r'),
            (Self::HIDDEN, 'h'),
            (Self::SYSTEM, 's'),
            (Self::ARCHIVE, 'a'),
            (Self::DEVICE, 'v'),
        ]
        .iter()
        .map(|(flag, c)| if self.contains(*flag) { *c } else { '-' })
        .collect()
    }
}

impl From<u8> for Attributes {
    fn from(value: u8) -> Self {
        Self::new(value)
    }
}

impl From<Attributes> for u8 {
    fn from(value: Attributes) -> Self {
        value.value()
    }
}

impl std::ops::BitOr for Attributes {
    type Output = Attributes;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

/// First byte of a record: either a status sentinel or the name length.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NameStatus {
    Unused,
    Deleted,
    EndOfDirectory,
    Valid(u8),
}

impl NameStatus {
    pub fn from_byte(value: u8) -> Result<Self, String> {
        match value {
            STATUS_UNUSED => Ok(NameStatus::Unused),
            STATUS_DELETED => Ok(NameStatus::Deleted),
            STATUS_END => Ok(NameStatus::EndOfDirectory),
            len if usize::from(len) <= MAX_NAME_LEN => Ok(NameStatus::Valid(len)),
            other => Err(format!("invalid name length or status byte {other:#04x}")),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            NameStatus::Unused => STATUS_UNUSED,
            NameStatus::Deleted => STATUS_DELETED,
            NameStatus::EndOfDirectory => STATUS_END,
            NameStatus::Valid(len) => len,
        }
    }

    /// Whether a new record may be written over this slot.
    pub fn is_reusable(self) -> bool {
        matches!(self, NameStatus::Unused | NameStatus::Deleted)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirRecord {
    pub status: NameStatus,
    pub name: String,
    pub attributes: Attributes,
    pub first_cluster: u32,
    pub file_size: u32,
    pub created: PackedTimestamp,
    pub modified: PackedTimestamp,
    pub accessed: PackedTimestamp,
}

impl DirRecord {
    /// Decodes one record. Only the status byte is inspected for sentinel
    /// slots; the rest of their bytes may be anything.
    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() < DIR_RECORD_SIZE {
            return Err(format!(
                "directory record needs {DIR_RECORD_SIZE} bytes, got {}",
                bytes.len()
            ));
        }

        let status = NameStatus::from_byte(bytes[0])?;
        let name = match status {
            NameStatus::Valid(0) => return Err("zero length name".to_string()),
            NameStatus::Valid(len) => {
                String::from_utf8_lossy(&bytes[1..1 + usize::from(len)]).into_owned()
            }
            _ => String::new(),
        };

        Ok(Self {
            status,
            name,
            attributes: Attributes::new(bytes[43]),
            first_cluster: BigEndian::read_u32(&bytes[44..48]),
            file_size: BigEndian::read_u32(&bytes[48..52]),
            created: PackedTimestamp::new(BigEndian::read_u32(&bytes[52..56])),
            modified: PackedTimestamp::new(BigEndian::read_u32(&bytes[56..60])),
            accessed: PackedTimestamp::new(BigEndian::read_u32(&bytes[60..64])),
        })
    }

    pub fn encode(&self) -> [u8; DIR_RECORD_SIZE] {
        let mut out = [0u8; DIR_RECORD_SIZE];
        let name = self.name.as_bytes();
        let len = name.len().min(MAX_NAME_LEN);

        out[0] = match self.status {
            NameStatus::Valid(_) => len as u8,
            other => other.to_byte(),
        };
        out[1..1 + MAX_NAME_LEN].fill(NAME_PADDING);
        out[1..1 + len].copy_from_slice(&name[..len]);
        out[43] = self.attributes.value();
        BigEndian::write_u32(&mut out[44..48], self.first_cluster);
        BigEndian::write_u32(&mut out[48..52], self.file_size);
        BigEndian::write_u32(&mut out[52..56], self.created.raw());
        BigEndian::write_u32(&mut out[56..60], self.modified.raw());
        BigEndian::write_u32(&mut out[60..64], self.accessed.raw());
        out
    }
}

pub fn validate_name(name: &str) -> Result<(), Error> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(Error::InvalidArgument(format!(
            "name '{name}' must be 1 to {MAX_NAME_LEN} bytes long"
        )));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !c.is_ascii() || c.is_ascii_control() || FORBIDDEN_NAME_CHARS.contains(c))
    {
        return Err(Error::InvalidArgument(format!(
            "name '{name}' contains unsupported character {c:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DirRecord {
        DirRecord {
            status: NameStatus::Valid(9),
            name: "save.data".to_string(),
            attributes: Attributes::ARCHIVE | Attributes::READ_ONLY,
            first_cluster: 0x1234,
            file_size: 10_000,
            created: PackedTimestamp::new(0x5A21_6000),
            modified: PackedTimestamp::new(0x5A22_6000),
            accessed: PackedTimestamp::new(0x5A23_6000),
        }
    }

    #[test]
    fn encodes_fields_at_fixed_offsets() {
        let bytes = sample().encode();
        assert_eq!(bytes[0], 9);
        assert_eq!(&bytes[1..10], b"save.data");
        assert!(bytes[10..43].iter().all(|b| *b == 0xFF));
        assert_eq!(bytes[43], 0x21);
        assert_eq!(&bytes[44..48], &[0, 0, 0x12, 0x34]);
        assert_eq!(&bytes[48..52], &10_000u32.to_be_bytes());
        assert_eq!(&bytes[60..64], &0x5A23_6000u32.to_be_bytes());
        assert_eq!(DirRecord::decode(&bytes).expect("decode"), sample());
    }

    #[test]
    fn sentinel_status_bytes_decode() {
        let mut bytes = [0xABu8; DIR_RECORD_SIZE];
        bytes[0] = 0xFF;
        assert_eq!(
            DirRecord::decode(&bytes).expect("decode").status,
            NameStatus::EndOfDirectory
        );
        bytes[0] = 0xE5;
        assert_eq!(
            DirRecord::decode(&bytes).expect("decode").status,
            NameStatus::Deleted
        );
        bytes[0] = 0x00;
        assert!(DirRecord::decode(&bytes).expect("decode").status.is_reusable());
    }

    #[test]
    fn malformed_status_bytes_are_rejected() {
        let mut bytes = [0u8; DIR_RECORD_SIZE];
        for status in [43u8, 0x80, 0xE4, 0xE6, 0xFE] {
            bytes[0] = status;
            assert!(DirRecord::decode(&bytes).is_err(), "status {status:#x}");
        }
        assert!(DirRecord::decode(&bytes[..32]).is_err());
    }

    #[test]
    fn name_rules() {
        assert!(validate_name("default.xex").is_ok());
        assert!(validate_name(&"a".repeat(42)).is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name(&"a".repeat(43)).is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("what?").is_err());
        assert!(validate_name("tab\there").is_err());
        assert!(validate_name("caf\u{e9}").is_err());
    }

    #[test]
    fn attributes_describe_flags() {
        let attributes = Attributes::DIRECTORY | Attributes::HIDDEN;
        assert!(attributes.is_directory());
        assert_eq!(attributes.describe(), "d-h---");
        assert_eq!(u8::from(attributes), 0x12);
    }
}
