use std::io::{Cursor, Read};

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use serde::Serialize;

use crate::hex::{self, parse_hex_buffer, parse_hex_u32};
use crate::Error;

pub const CERTIFICATE_SIZE: usize = 602;
pub const CONSOLE_ID_LEN: usize = 5;
pub const PART_NUMBER_LEN: usize = 0x14;
pub const DATE_GENERATION_LEN: usize = 8;
pub const PUBLIC_MODULUS_LEN: usize = 0x80;
pub const CERTIFICATE_SIGNATURE_LEN: usize = 0x100;
pub const SIGNATURE_LEN: usize = 0x80;
const RESERVED_LEN: usize = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConsoleType {
    Devkit,
    Retail,
    TestKit,
    DevkitRecoveryGenerated,
}

impl ConsoleType {
    pub const ALL: [ConsoleType; 4] = [
        ConsoleType::Devkit,
        ConsoleType::Retail,
        ConsoleType::TestKit,
        ConsoleType::DevkitRecoveryGenerated,
    ];

    pub const fn code(self) -> u8 {
        match self {
            ConsoleType::Devkit => 1,
            ConsoleType::Retail => 2,
            ConsoleType::TestKit => 3,
            ConsoleType::DevkitRecoveryGenerated => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }

    pub const fn label(self) -> &'static str {
        match self {
            ConsoleType::Devkit => "Devkit",
            ConsoleType::Retail => "Retail",
            ConsoleType::TestKit => "TestKit",
            ConsoleType::DevkitRecoveryGenerated => "DevKit Recovery Generated",
        }
    }
}

/// Console identity certificate. Stored and rewritten only as one 602 byte
/// record; the trailing reserved bytes are carried through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Certificate {
    pub public_key_certificate_size: u32,
    #[serde(serialize_with = "hex::serialize")]
    pub owner_console_id: [u8; CONSOLE_ID_LEN],
    #[serde(serialize_with = "serialize_ascii")]
    owner_console_part_number: [u8; PART_NUMBER_LEN],
    pub owner_console_type: ConsoleType,
    #[serde(serialize_with = "serialize_ascii")]
    date_generation: [u8; DATE_GENERATION_LEN],
    pub public_exponent: u32,
    #[serde(serialize_with = "hex::serialize")]
    pub public_modulus: [u8; PUBLIC_MODULUS_LEN],
    #[serde(serialize_with = "hex::serialize")]
    pub certificate_signature: [u8; CERTIFICATE_SIGNATURE_LEN],
    #[serde(serialize_with = "hex::serialize")]
    pub signature: [u8; SIGNATURE_LEN],
    #[serde(skip)]
    reserved: [u8; RESERVED_LEN],
}

/// User-facing text form of the editable certificate fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateEdit {
    pub public_key_certificate_size: String,
    pub owner_console_id: String,
    pub owner_console_part_number: String,
    pub owner_console_type: ConsoleType,
    pub date_generation: String,
    pub public_exponent: String,
}

impl Certificate {
    pub fn new(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < CERTIFICATE_SIZE {
            return Err(Error::Format(format!(
                "certificate needs {CERTIFICATE_SIZE} bytes, got {}",
                bytes.len()
            )));
        }

        let mut c = Cursor::new(&bytes[..CERTIFICATE_SIZE]);
        let read_err = |err: std::io::Error| Error::Format(err.to_string());

        let public_key_certificate_size = c.read_u32::<BigEndian>().map_err(read_err)?;
        let mut owner_console_id = [0u8; CONSOLE_ID_LEN];
        c.read_exact(&mut owner_console_id).map_err(read_err)?;
        let mut owner_console_part_number = [0u8; PART_NUMBER_LEN];
        c.read_exact(&mut owner_console_part_number).map_err(read_err)?;
        let type_code = c.read_u8().map_err(read_err)?;
        let owner_console_type = ConsoleType::from_code(type_code)
            .ok_or_else(|| Error::Format(format!("unknown console type {type_code:#04x}")))?;
        let mut date_generation = [0u8; DATE_GENERATION_LEN];
        c.read_exact(&mut date_generation).map_err(read_err)?;
        let public_exponent = c.read_u32::<BigEndian>().map_err(read_err)?;
        let mut public_modulus = [0u8; PUBLIC_MODULUS_LEN];
        c.read_exact(&mut public_modulus).map_err(read_err)?;
        let mut certificate_signature = [0u8; CERTIFICATE_SIGNATURE_LEN];
        c.read_exact(&mut certificate_signature).map_err(read_err)?;
        let mut signature = [0u8; SIGNATURE_LEN];
        c.read_exact(&mut signature).map_err(read_err)?;
        let mut reserved = [0u8; RESERVED_LEN];
        c.read_exact(&mut reserved).map_err(read_err)?;

        Ok(Self {
            public_key_certificate_size,
            owner_console_id,
            owner_console_part_number,
            owner_console_type,
            date_generation,
            public_exponent,
            public_modulus,
            certificate_signature,
            signature,
            reserved,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = [0u8; CERTIFICATE_SIZE];
        BigEndian::write_u32(&mut out[0..4], self.public_key_certificate_size);
        out[4..9].copy_from_slice(&self.owner_console_id);
        out[9..29].copy_from_slice(&self.owner_console_part_number);
        out[29] = self.owner_console_type.code();
        out[30..38].copy_from_slice(&self.date_generation);
        BigEndian::write_u32(&mut out[38..42], self.public_exponent);
        out[42..170].copy_from_slice(&self.public_modulus);
        out[170..426].copy_from_slice(&self.certificate_signature);
        out[426..554].copy_from_slice(&self.signature);
        out[554..].copy_from_slice(&self.reserved);
        out.to_vec()
    }

    pub fn owner_console_part_number(&self) -> String {
        ascii_field(&self.owner_console_part_number)
    }

    pub fn date_generation(&self) -> String {
        ascii_field(&self.date_generation)
    }

    pub fn to_edit(&self) -> CertificateEdit {
        CertificateEdit {
            public_key_certificate_size: format!("{:X}", self.public_key_certificate_size),
            owner_console_id: hex::to_hex_string(&self.owner_console_id, false),
            owner_console_part_number: self.owner_console_part_number(),
            owner_console_type: self.owner_console_type,
            date_generation: self.date_generation(),
            public_exponent: format!("{:X}", self.public_exponent),
        }
    }

    /// Validates every field of `edit` and returns the rewritten record. On
    /// any invalid field nothing is applied.
    pub fn with_edit(&self, edit: &CertificateEdit) -> Result<Certificate, Error> {
        let public_key_certificate_size = parse_hex_u32(
            &edit.public_key_certificate_size,
            "The Public Key Certificate Size",
        )?;
        let owner_console_id =
            parse_hex_buffer::<CONSOLE_ID_LEN>(edit.owner_console_id.trim(), "The ConsoleID")?;

        let part_number = edit.owner_console_part_number.as_str();
        if part_number.len() > PART_NUMBER_LEN || !part_number.is_ascii() {
            return Err(Error::InvalidArgument(format!(
                "The Console Part Number must be at most {PART_NUMBER_LEN} ASCII characters"
            )));
        }

        let date = edit.date_generation.as_str();
        if date.len() != DATE_GENERATION_LEN || !date.is_ascii() {
            return Err(Error::InvalidArgument(format!(
                "The Date of Generation must be {DATE_GENERATION_LEN} ASCII characters"
            )));
        }

        let public_exponent = parse_hex_u32(&edit.public_exponent, "The Public Exponent")?;

        let mut updated = self.clone();
        updated.public_key_certificate_size = public_key_certificate_size;
        updated.owner_console_id = owner_console_id;
        updated.owner_console_part_number = [0u8; PART_NUMBER_LEN];
        updated.owner_console_part_number[..part_number.len()]
            .copy_from_slice(part_number.as_bytes());
        updated.owner_console_type = edit.owner_console_type;
        updated
            .date_generation
            .copy_from_slice(&date.as_bytes()[..DATE_GENERATION_LEN]);
        updated.public_exponent = public_exponent;
        Ok(updated)
    }
}

fn serialize_ascii<S, T>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
    T: AsRef<[u8]>,
{
    serializer.serialize_str(&ascii_field(bytes.as_ref()))
}

fn ascii_field(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
