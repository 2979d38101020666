//! Byte-offset access to the storage holding the volume.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Raw storage primitive. Offsets are absolute device byte offsets; the driver
/// never reasons about anything finer.
pub trait BlockDevice {
    /// Fills `buf` from `offset`. Running past the end of the device is an
    /// error.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Writes `data` at `offset` and returns how many bytes were written.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<usize>;

    fn len(&mut self) -> io::Result<u64>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// An image file or a raw device node.
#[derive(Debug)]
pub struct FileDevice {
    file: File,
}

impl FileDevice {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }

    pub fn open_read_only(path: &Path) -> io::Result<Self> {
        Ok(Self {
            file: File::open(path)?,
        })
    }

    pub fn from_file(file: File) -> Self {
        Self { file }
    }
}

impl BlockDevice for FileDevice {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(data.len())
    }

    fn len(&mut self) -> io::Result<u64> {
        self.file.seek(SeekFrom::End(0))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_data()
    }
}

/// Fixed-size in-memory device. Writes never grow it.
#[derive(Debug, Clone, Default)]
pub struct MemoryDevice {
    data: Vec<u8>,
}

impl MemoryDevice {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn zeroed(len: usize) -> Self {
        Self {
            data: vec![0u8; len],
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    fn range(&self, offset: u64, len: usize) -> io::Result<std::ops::Range<usize>> {
        let start = usize::try_from(offset).map_err(|_| out_of_bounds(offset))?;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| out_of_bounds(offset))?;
        Ok(start..end)
    }
}

fn out_of_bounds(offset: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("access at {offset:#x} runs past the end of the device"),
    )
}

impl BlockDevice for MemoryDevice {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<usize> {
        let range = self.range(offset, data.len())?;
        self.data[range].copy_from_slice(data);
        Ok(data.len())
    }

    fn len(&mut self) -> io::Result<u64> {
        Ok(self.data.len() as u64)
    }
}

impl<D: BlockDevice + ?Sized> BlockDevice for Box<D> {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        (**self).read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<usize> {
        (**self).write_at(offset, data)
    }

    fn len(&mut self) -> io::Result<u64> {
        (**self).len()
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_device_rejects_out_of_range_access() {
        let mut device = MemoryDevice::zeroed(16);
        let mut buf = [0u8; 4];
        assert!(device.read_at(14, &mut buf).is_err());
        assert!(device.write_at(u64::MAX, &buf).is_err());
        assert_eq!(device.write_at(12, &[1, 2, 3, 4]).expect("write"), 4);
        device.read_at(12, &mut buf).expect("read");
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn file_device_reads_back_writes() {
        let file = tempfile::tempfile().expect("temp file");
        file.set_len(4096).expect("size file");
        let mut device = FileDevice::from_file(file);
        device.write_at(1000, b"FATX").expect("write");
        let mut buf = [0u8; 4];
        device.read_at(1000, &mut buf).expect("read");
        assert_eq!(&buf, b"FATX");
        assert_eq!(device.len().expect("len"), 4096);
    }
}
