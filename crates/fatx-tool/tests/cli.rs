use std::fs;
use std::path::{Path, PathBuf};

use fatx::{DeviceLayout, FatxVolume, FileDevice};
use fatx_tool::{Error, FormatOptions};
use serde_json::Value;
use tempfile::{tempdir, TempDir};

const IMAGE_LEN: u64 = 0x40_0000;

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

struct Image {
    dir: TempDir,
    path: PathBuf,
    layout: DeviceLayout,
}

impl Image {
    fn open(&self) -> FatxVolume<FileDevice> {
        fatx_tool::open_volume(&self.path, &self.layout, true).expect("open image")
    }
}

/// A scratch image with only the Content slot formatted.
fn content_image() -> Image {
    colored::control::set_override(false);
    let dir = tempdir().expect("temp dir");
    let layout_path = dir.path().join("layout.toml");
    fs::write(&layout_path, LAYOUT).expect("write layout");
    let layout = fatx_tool::load_layout(Some(&layout_path)).expect("load layout");

    let path = dir.path().join("drive.img");
    let options = FormatOptions {
        slot: "Content",
        size: Some(IMAGE_LEN),
        sectors_per_cluster: 8,
        serial: Some(0x1234_5678),
    };
    let mut out = Vec::new();
    fatx_tool::format_image(&path, &layout, &options, &mut out).expect("format image");
    assert!(String::from_utf8_lossy(&out).contains("Formatted Content"));

    Image { dir, path, layout }
}

fn host_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).expect("write host file");
    path
}

fn listed_names(volume: &mut FatxVolume<FileDevice>, path: &str) -> Vec<String> {
    let mut out = Vec::new();
    fatx_tool::ls(volume, path, true, &mut out).expect("ls");
    let listing: Value = serde_json::from_slice(&out).expect("ls json");
    listing
        .as_array()
        .expect("array")
        .iter()
        .map(|entry| entry["name"].as_str().expect("name").to_string())
        .collect()
}

#[test]
fn partitions_reports_every_slot() {
    let image = content_image();
    let mut volume = image.open();

    let mut out = Vec::new();
    fatx_tool::partitions(&mut volume, true, &mut out).expect("partitions");
    let slots: Value = serde_json::from_slice(&out).expect("json");
    assert_eq!(slots[0]["name"], "System");
    assert_eq!(slots[0]["status"], "missing");
    assert_eq!(slots[1]["name"], "Content");
    assert_eq!(slots[1]["status"], "mounted");
    assert_eq!(slots[1]["serial"], 0x1234_5678);
    assert_eq!(slots[1]["fat_bits"], 16);

    let mut out = Vec::new();
    fatx_tool::partitions(&mut volume, false, &mut out).expect("partitions");
    let text = String::from_utf8(out).expect("utf8");
    assert!(text.contains("not present"));
    assert!(text.contains("FAT16"));
}

#[test]
fn inject_list_and_cat_round_trip() {
    let image = content_image();
    let hello = host_file(image.dir.path(), "hello.txt", b"hello from the host");
    let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let big = host_file(image.dir.path(), "big.bin", &data);

    let mut volume = image.open();
    let mut out = Vec::new();
    fatx_tool::mkdir(&mut volume, "Content\\Saves", &mut out).expect("mkdir");
    let injected =
        fatx_tool::inject(&mut volume, "Content\\Saves", &[hello, big], &mut out).expect("inject");
    assert_eq!(injected, 2);
    assert!(String::from_utf8_lossy(&out).contains("+ Adding Content\\Saves\\big.bin"));
    volume.close().expect("close");

    let mut volume = image.open();
    assert_eq!(listed_names(&mut volume, "Content"), vec!["Saves"]);
    assert_eq!(
        listed_names(&mut volume, "Content\\Saves"),
        vec!["hello.txt", "big.bin"]
    );

    let mut contents = Vec::new();
    let copied = fatx_tool::cat(&mut volume, "content/saves/BIG.BIN", &mut contents).expect("cat");
    assert_eq!(copied, 10_000);
    assert_eq!(contents, data);

    let mut out = Vec::new();
    assert!(matches!(
        fatx_tool::cat(&mut volume, "Content\\Saves", &mut out),
        Err(Error::ArgumentError(_))
    ));
}

#[test]
fn injected_directory_extracts_back() {
    let image = content_image();
    let source = image.dir.path().join("Game");
    fs::create_dir_all(source.join("Data")).expect("host dirs");
    host_file(&source, "title.txt", b"title");
    host_file(&source.join("Data"), "level1.dat", &[7u8; 5000]);

    let mut volume = image.open();
    let mut out = Vec::new();
    let injected =
        fatx_tool::inject(&mut volume, "Content", &[source.clone()], &mut out).expect("inject");
    assert_eq!(injected, 2);

    let dest = image.dir.path().join("out");
    let extracted = fatx_tool::extract(&mut volume, "Content\\Game", &dest, &mut out)
        .expect("extract");
    assert_eq!(extracted, 2);
    assert_eq!(
        fs::read(dest.join("Game").join("title.txt")).expect("title"),
        b"title"
    );
    assert_eq!(
        fs::read(dest.join("Game").join("Data").join("level1.dat")).expect("level"),
        vec![7u8; 5000]
    );
}

#[test]
fn rm_frees_space_and_refuses_roots() {
    let image = content_image();
    let payload = host_file(image.dir.path(), "payload.bin", &[1u8; 20_000]);

    let mut volume = image.open();
    let before = fatx_tool::usage(&mut volume).expect("usage");
    let mut out = Vec::new();
    fatx_tool::mkdir(&mut volume, "Content\\Cache", &mut out).expect("mkdir");
    fatx_tool::inject(&mut volume, "Content\\Cache", &[payload], &mut out).expect("inject");

    let removed = fatx_tool::rm(&mut volume, "Content\\Cache", &mut out).expect("rm");
    assert_eq!(removed, 2);
    let after = fatx_tool::usage(&mut volume).expect("usage");
    assert_eq!(before[0].free_bytes, after[0].free_bytes);
    assert!(listed_names(&mut volume, "Content").is_empty());

    assert!(matches!(
        fatx_tool::rm(&mut volume, "Content", &mut out),
        Err(Error::ArgumentError(_))
    ));
    assert!(matches!(
        fatx_tool::rm(&mut volume, "Content\\Missing", &mut out),
        Err(Error::Fatx(fatx::Error::NotFound(_)))
    ));
}

#[test]
fn mkdir_needs_a_parent_path() {
    let image = content_image();
    let mut volume = image.open();
    let mut out = Vec::new();
    assert!(matches!(
        fatx_tool::mkdir(&mut volume, "Content", &mut out),
        Err(Error::ArgumentError(_))
    ));
    assert!(matches!(
        fatx_tool::mkdir(&mut volume, "Content\\bad?name", &mut out),
        Err(Error::Fatx(fatx::Error::InvalidArgument(_)))
    ));
}

#[test]
fn free_lists_mounted_partitions() {
    let image = content_image();
    let mut volume = image.open();
    let usage = fatx_tool::usage(&mut volume).expect("usage");
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].name, "Content");
    assert_eq!(usage[0].used_bytes + usage[0].free_bytes, usage[0].total_bytes);

    let mut out = Vec::new();
    fatx_tool::free(&mut volume, &mut out).expect("free");
    assert!(String::from_utf8_lossy(&out).starts_with("Content"));
}

#[test]
fn security_blob_is_saved_and_decoded() {
    let image = content_image();
    let mut bytes = fs::read(&image.path).expect("read image");
    bytes[0x2000..0x2014].copy_from_slice(b"5VJ1DX3C            ");
    bytes[0x201C..0x2027].copy_from_slice(b"ST9250315AS");
    fs::write(&image.path, &bytes).expect("write image");

    let mut volume = image.open();
    let dest = image.dir.path().join("security.bin");
    let mut out = Vec::new();
    fatx_tool::security_blob(&mut volume, &dest, &mut out).expect("security blob");
    assert_eq!(fs::read(&dest).expect("blob").len(), 0x228);
    let text = String::from_utf8(out).expect("utf8");
    assert!(text.contains("5VJ1DX3C"));
    assert!(text.contains("ST9250315AS"));
}

fn certificate_bytes(console_type: u8) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(602);
    bytes.extend_from_slice(&0x1A8u32.to_be_bytes());
    bytes.extend_from_slice(&[0x12, 0x34, 0x56, 0x78, 0x9A]);
    let mut part = [0u8; 0x14];
    part[..10].copy_from_slice(b"X803395-00");
    bytes.extend_from_slice(&part);
    bytes.push(console_type);
    bytes.extend_from_slice(b"09-18-06");
    bytes.extend_from_slice(&3u32.to_be_bytes());
    bytes.resize(602, 0xAA);
    bytes
}

#[test]
fn cert_reads_at_an_offset() {
    colored::control::set_override(false);
    let dir = tempdir().expect("temp dir");
    let mut contents = vec![0u8; 0x100];
    contents.extend(certificate_bytes(2));
    let path = host_file(dir.path(), "kv.bin", &contents);

    let mut out = Vec::new();
    fatx_tool::cert(&path, 0x100, true, &mut out).expect("cert json");
    let certificate: Value = serde_json::from_slice(&out).expect("json");
    assert_eq!(certificate["owner_console_type"], "Retail");
    assert_eq!(certificate["public_exponent"], 3);

    let mut out = Vec::new();
    fatx_tool::cert(&path, 0x100, false, &mut out).expect("cert text");
    let text = String::from_utf8(out).expect("utf8");
    assert!(text.contains("123456789A"));
    assert!(text.contains("X803395-00"));
    assert!(text.contains("Retail"));
}

#[test]
fn cert_rejects_truncated_and_unknown_records() {
    let dir = tempdir().expect("temp dir");
    let short = host_file(dir.path(), "short.bin", &certificate_bytes(2)[..300]);
    let mut out = Vec::new();
    assert!(matches!(
        fatx_tool::cert(&short, 0, false, &mut out),
        Err(Error::IOError(_))
    ));

    let unknown = host_file(dir.path(), "unknown.bin", &certificate_bytes(9));
    assert!(matches!(
        fatx_tool::cert(&unknown, 0, false, &mut out),
        Err(Error::RecordError(_))
    ));
}

#[test]
fn format_rejects_unknown_slots() {
    let image = content_image();
    let options = FormatOptions {
        slot: "Games",
        size: None,
        sectors_per_cluster: 8,
        serial: None,
    };
    let mut out = Vec::new();
    assert!(matches!(
        fatx_tool::format_image(&image.path, &image.layout, &options, &mut out),
        Err(Error::ArgumentError(_))
    ));
}
