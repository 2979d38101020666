//! Commands behind the `fatx` binary. Each command works on an already open
//! volume (or a plain host file) and prints to the writer it is given, so
//! the same code runs against drive images in tests.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytesize::ByteSize;
use colored::Colorize;
use fatx::format::format_slot;
use fatx::{
    BlockDevice, DeviceLayout, EntryId, FatxVolume, FileDevice, NewEntry, PackedTimestamp,
    SlotOutcome,
};
use serde::Serialize;
use xbox_filetypes::{hex, Certificate, CERTIFICATE_SIZE};

pub mod logger;

#[derive(Debug)]
pub enum Error {
    Fatx(fatx::Error),
    RecordError(xbox_filetypes::Error),
    IOError(std::io::Error),
    JsonError(serde_json::Error),
    ArgumentError(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Fatx(err) => write!(f, "{err}"),
            Error::RecordError(err) => write!(f, "{err}"),
            Error::IOError(err) => write!(f, "{err}"),
            Error::JsonError(err) => write!(f, "{err}"),
            Error::ArgumentError(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Fatx(err) => Some(err),
            Error::RecordError(err) => Some(err),
            Error::IOError(err) => Some(err),
            Error::JsonError(err) => Some(err),
            Error::ArgumentError(_) => None,
        }
    }
}

impl From<fatx::Error> for Error {
    fn from(err: fatx::Error) -> Self {
        Error::Fatx(err)
    }
}

impl From<xbox_filetypes::Error> for Error {
    fn from(err: xbox_filetypes::Error) -> Self {
        Error::RecordError(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IOError(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::JsonError(err)
    }
}

/// The layout from `path`, or the built-in hard drive table.
pub fn load_layout(path: Option<&Path>) -> Result<DeviceLayout, Error> {
    match path {
        Some(path) => Ok(DeviceLayout::load(path)?),
        None => Ok(DeviceLayout::xbox360_hdd().clone()),
    }
}

pub fn open_volume(
    device: &Path,
    layout: &DeviceLayout,
    writable: bool,
) -> Result<FatxVolume<FileDevice>, Error> {
    let volume = if writable {
        FatxVolume::open(device, layout.clone())?
    } else {
        FatxVolume::open_read_only(device, layout.clone())?
    };
    Ok(volume)
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotSummary {
    pub name: String,
    pub offset: u64,
    pub status: &'static str,
    pub serial: Option<u32>,
    pub size: Option<u64>,
    pub cluster_size: Option<u64>,
    pub cluster_count: Option<u32>,
    pub fat_bits: Option<u64>,
    pub free_bytes: Option<u64>,
    pub error: Option<String>,
}

/// One summary per layout slot, mounted or not.
pub fn slot_summaries<D: BlockDevice>(
    volume: &mut FatxVolume<D>,
) -> Result<Vec<SlotSummary>, Error> {
    let mut pending = Vec::new();
    for report in volume.slot_reports() {
        let mut summary = SlotSummary {
            name: report.name.clone(),
            offset: report.offset,
            status: "missing",
            serial: None,
            size: None,
            cluster_size: None,
            cluster_count: None,
            fat_bits: None,
            free_bytes: None,
            error: None,
        };
        let mounted = match &report.outcome {
            SlotOutcome::Mounted(id) => Some(*id),
            SlotOutcome::Missing => None,
            SlotOutcome::Rejected(err) => {
                summary.status = "rejected";
                summary.error = Some(err.to_string());
                None
            }
        };
        pending.push((summary, mounted));
    }

    let mut summaries = Vec::with_capacity(pending.len());
    for (mut summary, mounted) in pending {
        if let Some(id) = mounted {
            let partition = volume.partition(id)?;
            summary.status = "mounted";
            summary.serial = Some(partition.serial);
            summary.size = Some(partition.size);
            summary.cluster_size = Some(partition.cluster_size);
            summary.cluster_count = Some(partition.cluster_count);
            summary.fat_bits = Some(partition.fat_width.bytes() * 8);
            summary.free_bytes = Some(volume.free_bytes(id)?);
        }
        summaries.push(summary);
    }
    Ok(summaries)
}

pub fn partitions<D: BlockDevice, W: Write>(
    volume: &mut FatxVolume<D>,
    json: bool,
    out: &mut W,
) -> Result<(), Error> {
    let summaries = slot_summaries(volume)?;
    if json {
        serde_json::to_writer_pretty(&mut *out, &summaries)?;
        writeln!(out)?;
        return Ok(());
    }

    if let Some(name) = volume.drive_name()? {
        writeln!(out, "{} {}", "Drive".bold(), name.green())?;
    }
    for summary in &summaries {
        match summary.status {
            "mounted" => writeln!(
                out,
                "{:<18} {:#012x} {:>12} {} clusters of {}, FAT{}, {} free",
                summary.name.green(),
                summary.offset,
                ByteSize::b(summary.size.unwrap_or(0)).to_string(),
                summary.cluster_count.unwrap_or(0),
                ByteSize::b(summary.cluster_size.unwrap_or(0)),
                summary.fat_bits.unwrap_or(0),
                ByteSize::b(summary.free_bytes.unwrap_or(0)),
            )?,
            "rejected" => writeln!(
                out,
                "{:<18} {:#012x} {}",
                summary.name.yellow(),
                summary.offset,
                summary.error.as_deref().unwrap_or("rejected").yellow()
            )?,
            _ => writeln!(
                out,
                "{:<18} {:#012x} {}",
                summary.name.dimmed(),
                summary.offset,
                "not present".dimmed()
            )?,
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct EntrySummary {
    pub name: String,
    pub path: String,
    pub directory: bool,
    pub attributes: String,
    pub size: u32,
    pub first_cluster: u32,
    pub modified: Option<String>,
}

fn format_timestamp(timestamp: PackedTimestamp) -> Option<String> {
    timestamp
        .to_datetime()
        .map(|value| value.format("%Y-%m-%d %H:%M:%S").to_string())
}

pub fn entry_summary<D: BlockDevice>(
    volume: &FatxVolume<D>,
    id: EntryId,
) -> Result<EntrySummary, Error> {
    let entry = volume.entry(id)?;
    Ok(EntrySummary {
        name: entry.name().to_string(),
        path: entry.full_path(),
        directory: entry.is_directory(),
        attributes: entry.attributes().describe(),
        size: entry.file_size(),
        first_cluster: entry.first_cluster(),
        modified: format_timestamp(entry.modified()),
    })
}

/// The children of the directory at `path`, or the file itself.
pub fn list_entries<D: BlockDevice>(
    volume: &mut FatxVolume<D>,
    path: &str,
) -> Result<Vec<EntrySummary>, Error> {
    let id = volume.find(path)?;
    if !volume.entry(id)?.is_directory() {
        return Ok(vec![entry_summary(volume, id)?]);
    }
    volume
        .get_child_file_entries(id)?
        .into_iter()
        .map(|child| entry_summary(volume, child))
        .collect()
}

pub fn ls<D: BlockDevice, W: Write>(
    volume: &mut FatxVolume<D>,
    path: &str,
    json: bool,
    out: &mut W,
) -> Result<(), Error> {
    let entries = list_entries(volume, path)?;
    if json {
        serde_json::to_writer_pretty(&mut *out, &entries)?;
        writeln!(out)?;
        return Ok(());
    }

    for entry in &entries {
        let modified = entry.modified.as_deref().unwrap_or("-");
        let name = if entry.directory {
            entry.name.blue().bold()
        } else {
            entry.name.normal()
        };
        writeln!(
            out,
            "{} {:>12} {:<19} {}",
            entry.attributes.dimmed(),
            entry.size,
            modified,
            name
        )?;
    }
    Ok(())
}

pub fn cat<D: BlockDevice, W: Write>(
    volume: &mut FatxVolume<D>,
    path: &str,
    out: &mut W,
) -> Result<u64, Error> {
    let id = volume.find(path)?;
    if volume.entry(id)?.is_directory() {
        return Err(Error::ArgumentError(format!("{path} is a directory")));
    }
    Ok(volume.extract_file(id, out)?)
}

/// Copies the entry at `path` below the host directory `dest`. Returns the
/// number of files written.
pub fn extract<D: BlockDevice, W: Write>(
    volume: &mut FatxVolume<D>,
    path: &str,
    dest: &Path,
    out: &mut W,
) -> Result<usize, Error> {
    let id = volume.find(path)?;
    fs::create_dir_all(dest)?;
    let files = volume.collect_files(id)?;
    for file in &files {
        writeln!(out, "+ {} {}", "Extracting", volume.entry(*file)?.full_path().green())?;
    }
    Ok(volume.extract_tree(id, dest)?)
}

fn host_name(source: &Path) -> Result<String, Error> {
    source
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            Error::ArgumentError(format!("{} has no usable file name", source.display()))
        })
}

/// Copies host files into the directory at `dir`. Host directories are
/// recreated with their contents.
pub fn inject<D: BlockDevice, W: Write>(
    volume: &mut FatxVolume<D>,
    dir: &str,
    sources: &[PathBuf],
    out: &mut W,
) -> Result<usize, Error> {
    let parent = volume.find(dir)?;
    if !volume.entry(parent)?.is_directory() {
        return Err(Error::ArgumentError(format!("{dir} is not a directory")));
    }

    let mut injected = 0;
    let mut stack: Vec<(EntryId, PathBuf)> = sources
        .iter()
        .rev()
        .map(|source| (parent, source.clone()))
        .collect();
    while let Some((parent, source)) = stack.pop() {
        let name = host_name(&source)?;
        if source.is_dir() {
            let mut new = NewEntry::directory(&name);
            if let Ok(modified) = fs::metadata(&source).and_then(|m| m.modified()) {
                new = new.with_timestamps(PackedTimestamp::from_system_time(modified));
            }
            let created = volume.create_file_entry(parent, new)?;
            writeln!(out, "+ {} {}", "Creating", volume.entry(created)?.full_path().green())?;

            let mut children = fs::read_dir(&source)?
                .map(|entry| entry.map(|entry| entry.path()))
                .collect::<Result<Vec<_>, _>>()?;
            children.sort();
            stack.extend(children.into_iter().rev().map(|child| (created, child)));
        } else if source.is_file() {
            let created = volume.inject_file(parent, &name, &source)?;
            writeln!(out, "+ {} {}", "Adding", volume.entry(created)?.full_path().green())?;
            injected += 1;
        } else {
            writeln!(
                out,
                "{} {} {}",
                "File".dimmed(),
                source.display().to_string().dimmed(),
                "does not exist, skipping".dimmed()
            )?;
        }
    }
    volume.flush()?;
    Ok(injected)
}

pub fn rm<D: BlockDevice, W: Write>(
    volume: &mut FatxVolume<D>,
    path: &str,
    out: &mut W,
) -> Result<usize, Error> {
    let id = volume.find(path)?;
    if volume.entry(id)?.is_root() {
        return Err(Error::ArgumentError(format!(
            "{path} is a partition root and cannot be removed"
        )));
    }
    let full_path = volume.entry(id)?.full_path();
    let removed = volume.delete_file(id)?;
    volume.flush()?;
    writeln!(out, "- {} {} ({removed} entries)", "Removed", full_path.red())?;
    Ok(removed)
}

fn split_parent(path: &str) -> Result<(&str, &str), Error> {
    let trimmed = path.trim_end_matches(['\\', '/']);
    trimmed
        .rsplit_once(['\\', '/'])
        .filter(|(parent, name)| !parent.is_empty() && !name.is_empty())
        .ok_or_else(|| {
            Error::ArgumentError(format!("{path} does not name an entry inside a partition"))
        })
}

pub fn mkdir<D: BlockDevice, W: Write>(
    volume: &mut FatxVolume<D>,
    path: &str,
    out: &mut W,
) -> Result<EntryId, Error> {
    let (parent, name) = split_parent(path)?;
    let parent = volume.find(parent)?;
    let id = volume.create_file_entry(parent, NewEntry::directory(name))?;
    volume.flush()?;
    writeln!(out, "+ {} {}", "Creating", volume.entry(id)?.full_path().green())?;
    Ok(id)
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageSummary {
    pub name: String,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub total_bytes: u64,
}

pub fn usage<D: BlockDevice>(volume: &mut FatxVolume<D>) -> Result<Vec<UsageSummary>, Error> {
    let ids: Vec<_> = volume.partition_ids().collect();
    let mut usage = Vec::with_capacity(ids.len());
    for id in ids {
        let total_bytes = volume.total_bytes(id)?;
        let free_bytes = volume.free_bytes(id)?;
        let cluster_size = volume.partition(id)?.cluster_size;
        usage.push(UsageSummary {
            name: volume.partition(id)?.name.clone(),
            used_bytes: u64::from(volume.used_clusters(id)?) * cluster_size,
            free_bytes,
            total_bytes,
        });
    }
    Ok(usage)
}

pub fn free<D: BlockDevice, W: Write>(
    volume: &mut FatxVolume<D>,
    out: &mut W,
) -> Result<(), Error> {
    for partition in usage(volume)? {
        writeln!(
            out,
            "{:<18} {:>12} used {:>12} free {:>12} total",
            partition.name.green(),
            ByteSize::b(partition.used_bytes).to_string(),
            ByteSize::b(partition.free_bytes).to_string(),
            ByteSize::b(partition.total_bytes).to_string(),
        )?;
    }
    Ok(())
}

/// Saves the raw security sector to `dest` and prints the decoded drive
/// identity.
pub fn security_blob<D: BlockDevice, W: Write>(
    volume: &mut FatxVolume<D>,
    dest: &Path,
    out: &mut W,
) -> Result<(), Error> {
    let written = volume.extract_security_blob_to(dest)?;
    let blob = volume.security_blob()?;
    writeln!(out, "+ {} {} ({written} bytes)", "Saved", dest.display().to_string().green())?;
    writeln!(out, "{:<16} {}", "Serial".bold(), blob.serial_number)?;
    writeln!(out, "{:<16} {}", "Model".bold(), blob.model_number)?;
    writeln!(out, "{:<16} {}", "Firmware".bold(), blob.firmware_revision)?;
    writeln!(
        out,
        "{:<16} {}",
        "Capacity".bold(),
        ByteSize::b(blob.capacity_bytes())
    )?;
    Ok(())
}

/// Reads a console certificate stored `offset` bytes into a host file.
pub fn read_certificate(file: &Path, offset: u64) -> Result<Certificate, Error> {
    let mut source = File::open(file)?;
    source.seek(SeekFrom::Start(offset))?;
    let mut bytes = vec![0u8; CERTIFICATE_SIZE];
    source.read_exact(&mut bytes)?;
    Ok(Certificate::new(&bytes)?)
}

pub fn cert<W: Write>(file: &Path, offset: u64, json: bool, out: &mut W) -> Result<(), Error> {
    let certificate = read_certificate(file, offset)?;
    if json {
        serde_json::to_writer_pretty(&mut *out, &certificate)?;
        writeln!(out)?;
        return Ok(());
    }

    let edit = certificate.to_edit();
    let rows = [
        ("Key size", edit.public_key_certificate_size),
        ("Console ID", edit.owner_console_id),
        ("Part number", edit.owner_console_part_number),
        ("Console type", edit.owner_console_type.label().to_string()),
        ("Generated", edit.date_generation),
        ("Exponent", edit.public_exponent),
        (
            "Modulus",
            hex::to_hex_string(&certificate.public_modulus[..16], true) + " ...",
        ),
    ];
    for (label, value) in rows {
        writeln!(out, "{:<16} {}", label.bold(), value)?;
    }
    Ok(())
}

pub struct FormatOptions<'a> {
    pub slot: &'a str,
    /// Creates or resizes the image to this many bytes first.
    pub size: Option<u64>,
    pub sectors_per_cluster: u32,
    pub serial: Option<u32>,
}

/// Writes an empty FATX partition into one layout slot of an image.
pub fn format_image<W: Write>(
    image: &Path,
    layout: &DeviceLayout,
    options: &FormatOptions,
    out: &mut W,
) -> Result<(), Error> {
    let slot = layout.slot(options.slot).ok_or_else(|| {
        Error::ArgumentError(format!("layout has no slot named {}", options.slot))
    })?;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(options.size.is_some())
        .truncate(false)
        .open(image)?;
    if let Some(size) = options.size {
        file.set_len(size)?;
    }
    let mut device = FileDevice::from_file(file);

    let serial = options
        .serial
        .unwrap_or_else(|| chrono::Local::now().timestamp() as u32);
    let geometry = format_slot(&mut device, slot, options.sectors_per_cluster, serial)?;
    writeln!(
        out,
        "+ {} {} ({} clusters of {})",
        "Formatted",
        slot.name.green(),
        geometry.cluster_count,
        ByteSize::b(geometry.cluster_size)
    )?;
    Ok(())
}
