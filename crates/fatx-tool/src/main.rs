use std::io::Write;
use std::path::{Path, PathBuf};

use argh::FromArgs;
use colored::Colorize;
use fatx::format::DEFAULT_SECTORS_PER_CLUSTER;
use fatx_tool::{logger, Error, FormatOptions};

#[derive(FromArgs)]
/// Inspect and modify FATX drives and drive images.
struct Args {
    /// partition layout TOML file (defaults to the Xbox 360 hard drive)
    #[argh(option)]
    layout: Option<PathBuf>,

    /// log driver activity
    #[argh(switch, short = 'v')]
    verbose: bool,

    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    Partitions(PartitionsArgs),
    Ls(LsArgs),
    Cat(CatArgs),
    Extract(ExtractArgs),
    Inject(InjectArgs),
    Rm(RmArgs),
    Mkdir(MkdirArgs),
    Free(FreeArgs),
    SecurityBlob(SecurityBlobArgs),
    Cert(CertArgs),
    Format(FormatArgs),
}

#[derive(FromArgs)]
/// List the partition slots of a device and what was found in each.
#[argh(subcommand, name = "partitions")]
struct PartitionsArgs {
    /// device or image path
    #[argh(positional)]
    device: PathBuf,

    /// print JSON
    #[argh(switch)]
    json: bool,
}

#[derive(FromArgs)]
/// List a directory, e.g. `Content\0000000000000000`.
#[argh(subcommand, name = "ls")]
struct LsArgs {
    /// device or image path
    #[argh(positional)]
    device: PathBuf,

    /// path starting with the partition name
    #[argh(positional)]
    path: String,

    /// print JSON
    #[argh(switch)]
    json: bool,
}

#[derive(FromArgs)]
/// Write a file's contents to stdout.
#[argh(subcommand, name = "cat")]
struct CatArgs {
    /// device or image path
    #[argh(positional)]
    device: PathBuf,

    /// path starting with the partition name
    #[argh(positional)]
    path: String,
}

#[derive(FromArgs)]
/// Copy a file or directory tree out to the host.
#[argh(subcommand, name = "extract")]
struct ExtractArgs {
    /// device or image path
    #[argh(positional)]
    device: PathBuf,

    /// path starting with the partition name
    #[argh(positional)]
    path: String,

    /// host directory to extract into
    #[argh(positional)]
    dest: PathBuf,
}

#[derive(FromArgs)]
/// Copy host files or directories into a directory.
#[argh(subcommand, name = "inject")]
struct InjectArgs {
    /// device or image path
    #[argh(positional)]
    device: PathBuf,

    /// target directory, starting with the partition name
    #[argh(positional)]
    dir: String,

    /// host files to copy
    #[argh(positional)]
    files: Vec<PathBuf>,
}

#[derive(FromArgs)]
/// Delete a file or a directory with everything below it.
#[argh(subcommand, name = "rm")]
struct RmArgs {
    /// device or image path
    #[argh(positional)]
    device: PathBuf,

    /// path starting with the partition name
    #[argh(positional)]
    path: String,
}

#[derive(FromArgs)]
/// Create an empty directory.
#[argh(subcommand, name = "mkdir")]
struct MkdirArgs {
    /// device or image path
    #[argh(positional)]
    device: PathBuf,

    /// path of the new directory
    #[argh(positional)]
    path: String,
}

#[derive(FromArgs)]
/// Show used and free space of every mounted partition.
#[argh(subcommand, name = "free")]
struct FreeArgs {
    /// device or image path
    #[argh(positional)]
    device: PathBuf,
}

#[derive(FromArgs)]
/// Save and decode the drive security sector.
#[argh(subcommand, name = "security-blob")]
struct SecurityBlobArgs {
    /// device or image path
    #[argh(positional)]
    device: PathBuf,

    /// host file to write
    #[argh(positional)]
    dest: PathBuf,
}

#[derive(FromArgs)]
/// Decode a console certificate from a host file.
#[argh(subcommand, name = "cert")]
struct CertArgs {
    /// file holding the certificate
    #[argh(positional)]
    file: PathBuf,

    /// byte offset of the certificate in the file
    #[argh(option, default = "0")]
    offset: u64,

    /// print JSON
    #[argh(switch)]
    json: bool,
}

#[derive(FromArgs)]
/// Write an empty FATX partition into one layout slot.
#[argh(subcommand, name = "format")]
struct FormatArgs {
    /// image path
    #[argh(positional)]
    image: PathBuf,

    /// slot name from the layout
    #[argh(option)]
    slot: String,

    /// create or resize the image to this many bytes
    #[argh(option)]
    size: Option<u64>,

    /// sectors per cluster
    #[argh(option, default = "DEFAULT_SECTORS_PER_CLUSTER")]
    sectors_per_cluster: u32,

    /// volume serial number
    #[argh(option)]
    serial: Option<u32>,
}

fn run(args: Args) -> Result<(), Error> {
    let layout = fatx_tool::load_layout(args.layout.as_deref())?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let open = |device: &Path, writable: bool| fatx_tool::open_volume(device, &layout, writable);

    match args.command {
        Command::Partitions(cmd) => {
            let mut volume = open(&cmd.device, false)?;
            fatx_tool::partitions(&mut volume, cmd.json, &mut out)?;
        }
        Command::Ls(cmd) => {
            let mut volume = open(&cmd.device, false)?;
            fatx_tool::ls(&mut volume, &cmd.path, cmd.json, &mut out)?;
        }
        Command::Cat(cmd) => {
            let mut volume = open(&cmd.device, false)?;
            fatx_tool::cat(&mut volume, &cmd.path, &mut out)?;
        }
        Command::Extract(cmd) => {
            let mut volume = open(&cmd.device, false)?;
            let count = fatx_tool::extract(&mut volume, &cmd.path, &cmd.dest, &mut out)?;
            writeln!(out, "{} files extracted", count)?;
        }
        Command::Inject(cmd) => {
            let mut volume = open(&cmd.device, true)?;
            let count = fatx_tool::inject(&mut volume, &cmd.dir, &cmd.files, &mut out)?;
            volume.close()?;
            writeln!(out, "{} files injected", count)?;
        }
        Command::Rm(cmd) => {
            let mut volume = open(&cmd.device, true)?;
            fatx_tool::rm(&mut volume, &cmd.path, &mut out)?;
            volume.close()?;
        }
        Command::Mkdir(cmd) => {
            let mut volume = open(&cmd.device, true)?;
            fatx_tool::mkdir(&mut volume, &cmd.path, &mut out)?;
            volume.close()?;
        }
        Command::Free(cmd) => {
            let mut volume = open(&cmd.device, false)?;
            fatx_tool::free(&mut volume, &mut out)?;
        }
        Command::SecurityBlob(cmd) => {
            let mut volume = open(&cmd.device, false)?;
            fatx_tool::security_blob(&mut volume, &cmd.dest, &mut out)?;
        }
        Command::Cert(cmd) => {
            fatx_tool::cert(&cmd.file, cmd.offset, cmd.json, &mut out)?;
        }
        Command::Format(cmd) => {
            let options = FormatOptions {
                slot: &cmd.slot,
                size: cmd.size,
                sectors_per_cluster: cmd.sectors_per_cluster,
                serial: cmd.serial,
            };
            fatx_tool::format_image(&cmd.image, &layout, &options, &mut out)?;
        }
    }
    out.flush()?;
    Ok(())
}

fn main() {
    let args: Args = argh::from_env();
    if let Err(err) = logger::init(args.verbose) {
        eprintln!("{}", err.to_string().yellow());
    }

    if let Err(err) = run(args) {
        eprintln!("{} {}", "error:".red().bold(), err.to_string().red());
        std::process::exit(1);
    }
}
