#![allow(dead_code)]

use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use tempfile::{TempDir, tempdir};
use zip::{CompressionMethod, ZipWriter, write::FileOptions};

pub const REFERENCE_HEADER: &str = "גוש חלקה,יום מכירה,תמורה מוצהרת בש\"ח,חלק נמכר,ישוב";
pub const SCAN_HEADER: &str =
    "parcel_id,sale_date,declared_profit,sold_fraction,location_name,snapshot_date";

/// Scratch directory helper that cleans up files automatically on drop.
pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        Self {
            temp_dir: tempdir().expect("temp dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes `contents` into a file under the workspace and returns the path.
    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        self.write_bytes(name, contents.as_bytes())
    }

    pub fn write_bytes(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        fs::write(&path, contents).expect("write temp file contents");
        path
    }

    pub fn read(&self, name: &str) -> String {
        let bytes = fs::read(self.temp_dir.path().join(name)).expect("read workspace file");
        String::from_utf8(bytes).expect("utf-8 output")
    }
}

/// CSV text from a header line and data lines.
pub fn csv(header: &str, rows: &[&str]) -> String {
    let mut text = String::from(header);
    text.push('\n');
    for row in rows {
        text.push_str(row);
        text.push('\n');
    }
    text
}

/// An in-memory zip archive with stored (uncompressed) members.
pub fn zip_archive(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut zip = ZipWriter::new(Cursor::new(&mut buf));
        for (name, contents) in members {
            let options: FileOptions<'_, ()> =
                FileOptions::default().compression_method(CompressionMethod::Stored);
            zip.start_file(*name, options).expect("start zip member");
            zip.write_all(contents).expect("write zip member");
        }
        zip.finish().expect("finish zip");
    }
    buf
}

/// Rewrites the compression method of `member` to Shrink, which the zip reader
/// does not support, in both its local and central directory headers.
pub fn with_unsupported_compression(mut archive: Vec<u8>, member: &str) -> Vec<u8> {
    const SHRINK: [u8; 2] = 1u16.to_le_bytes();
    let name = member.as_bytes();
    // (signature, method offset, name length offset, name offset)
    let headers = [(b"PK\x03\x04", 8, 26, 30), (b"PK\x01\x02", 10, 28, 46)];
    for (signature, method_at, name_len_at, name_at) in headers {
        let mut pos = 0;
        while let Some(found) = archive[pos..].windows(4).position(|w| w == signature) {
            let start = pos + found;
            pos = start + 4;
            let Some(len) = archive
                .get(start + name_len_at..start + name_len_at + 2)
                .map(|b| u16::from_le_bytes([b[0], b[1]]) as usize)
            else {
                continue;
            };
            if archive.get(start + name_at..start + name_at + len) == Some(name) {
                archive[start + method_at..start + method_at + 2].copy_from_slice(&SHRINK);
            }
        }
    }
    archive
}
