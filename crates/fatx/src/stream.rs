//! Byte cursor over one file's cluster chain.
//!
//! `FatxStream` implements `Read`, `Write` and `Seek`, so fixed-width integers
//! come from `byteorder::{ReadBytesExt, WriteBytesExt}` with `BigEndian`; text
//! helpers for 8 and 16 bit characters are provided here.

use std::io::{self, Read, Seek, SeekFrom, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::device::BlockDevice;
use crate::entry::EntryId;
use crate::volume::FatxVolume;
use crate::Error;

pub struct FatxStream<'a, D: BlockDevice> {
    volume: &'a mut FatxVolume<D>,
    entry: EntryId,
    position: u64,
}

impl<'a, D: BlockDevice> FatxStream<'a, D> {
    pub(crate) fn new(volume: &'a mut FatxVolume<D>, entry: EntryId) -> Self {
        Self {
            volume,
            entry,
            position: 0,
        }
    }

    pub fn entry(&self) -> EntryId {
        self.entry
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Any position is accepted; reading past the end yields no data and
    /// writing past the end grows the file.
    pub fn set_position(&mut self, position: u64) {
        self.position = position;
    }

    pub fn len(&self) -> Result<u64, Error> {
        Ok(u64::from(self.volume.entry(self.entry)?.file_size()))
    }

    pub fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.len()? == 0)
    }

    /// Reads `len` bytes of 8 bit text, dropping trailing NULs.
    pub fn read_ascii(&mut self, len: usize) -> io::Result<String> {
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        let end = buf.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
        Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
    }

    /// Reads `chars` big-endian UTF-16 code units.
    pub fn read_wstring(&mut self, chars: usize) -> io::Result<String> {
        let mut units = Vec::with_capacity(chars);
        for _ in 0..chars {
            units.push(self.read_u16::<BigEndian>()?);
        }
        let end = units.iter().rposition(|u| *u != 0).map_or(0, |i| i + 1);
        Ok(String::from_utf16_lossy(&units[..end]))
    }

    pub fn write_ascii(&mut self, text: &str) -> io::Result<()> {
        self.write_all(text.as_bytes())
    }

    pub fn write_wstring(&mut self, text: &str) -> io::Result<()> {
        for unit in text.encode_utf16() {
            self.write_u16::<BigEndian>(unit)?;
        }
        Ok(())
    }
}

impl<D: BlockDevice> Read for FatxStream<'_, D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.volume.read_entry_at(self.entry, self.position, buf)?;
        self.position += read as u64;
        Ok(read)
    }
}

impl<D: BlockDevice> Write for FatxStream<'_, D> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.volume.write_entry_at(self.entry, self.position, buf)?;
        self.position += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.volume.flush().map_err(io::Error::from)
    }
}

impl<D: BlockDevice> Seek for FatxStream<'_, D> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.len()?.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        let Some(target) = target else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative position",
            ));
        };
        self.position = target;
        Ok(target)
    }
}
