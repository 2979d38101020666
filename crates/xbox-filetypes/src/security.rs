use byteorder::{BigEndian, ByteOrder};
use serde::Serialize;

use crate::Error;

/// Size of the security sector copied off a hard drive.
pub const SECURITY_BLOB_SIZE: usize = 0x228;

const SERIAL_NUMBER: std::ops::Range<usize> = 0x00..0x14;
const FIRMWARE_REVISION: std::ops::Range<usize> = 0x14..0x1C;
const MODEL_NUMBER: std::ops::Range<usize> = 0x1C..0x44;
const LOGO_HASH: std::ops::Range<usize> = 0x44..0x58;
const USER_ADDRESSABLE_SECTORS: usize = 0x58;
const SIGNATURE: std::ops::Range<usize> = 0x5C..0x15C;

/// Identity fields of the drive security sector. The signature is exposed as
/// bytes only; it is never checked here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityBlob {
    pub serial_number: String,
    pub firmware_revision: String,
    pub model_number: String,
    #[serde(serialize_with = "crate::hex::serialize")]
    pub logo_hash: [u8; 0x14],
    pub user_addressable_sectors: u32,
    #[serde(skip)]
    pub signature: Vec<u8>,
}

impl SecurityBlob {
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < SIGNATURE.end {
            return Err(Error::Format(format!(
                "security blob needs at least {} bytes, got {}",
                SIGNATURE.end,
                bytes.len()
            )));
        }

        let mut logo_hash = [0u8; 0x14];
        logo_hash.copy_from_slice(&bytes[LOGO_HASH]);

        Ok(Self {
            serial_number: ata_string(&bytes[SERIAL_NUMBER]),
            firmware_revision: ata_string(&bytes[FIRMWARE_REVISION]),
            model_number: ata_string(&bytes[MODEL_NUMBER]),
            logo_hash,
            user_addressable_sectors: BigEndian::read_u32(
                &bytes[USER_ADDRESSABLE_SECTORS..USER_ADDRESSABLE_SECTORS + 4],
            ),
            signature: bytes[SIGNATURE].to_vec(),
        })
    }

    pub fn capacity_bytes(&self) -> u64 {
        u64::from(self.user_addressable_sectors) * 0x200
    }
}

fn ata_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_identity_strings() {
        let mut bytes = vec![0u8; SECURITY_BLOB_SIZE];
        bytes[SERIAL_NUMBER].copy_from_slice(b"  5VJ1DX3C          ");
        bytes[FIRMWARE_REVISION].copy_from_slice(b"0002CE02");
        let model = b"ST9250315AS                             ";
        bytes[MODEL_NUMBER].copy_from_slice(model);
        bytes[USER_ADDRESSABLE_SECTORS..USER_ADDRESSABLE_SECTORS + 4]
            .copy_from_slice(&0x1D1C_5970u32.to_be_bytes());

        let blob = SecurityBlob::parse(&bytes).expect("parse blob");
        assert_eq!(blob.serial_number, "5VJ1DX3C");
        assert_eq!(blob.firmware_revision, "0002CE02");
        assert_eq!(blob.model_number, "ST9250315AS");
        assert_eq!(blob.capacity_bytes(), 0x1D1C_5970u64 * 512);
        assert_eq!(blob.signature.len(), 0x100);
    }

    #[test]
    fn truncated_blob_is_rejected() {
        assert!(SecurityBlob::parse(&[0u8; 0x100]).is_err());
    }
}
