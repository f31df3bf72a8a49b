//! ASAR container reading
//!
//! Layout: a 4-byte size pickle, then a pickle holding the header JSON.
//!
//! ```text
//! [u32 = 4][u32 header_size][u32 payload_size][u32 json_len][json ...][pad][file data ...]
//! ```
//!
//! File data starts at `8 + header_size`. Each file entry carries its size and
//! a decimal string offset relative to that start.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use serde_json::Value;

use crate::error::{PatchError, PatchResult};

/// Parsed ASAR header.
#[derive(Debug, Clone)]
pub struct AsarHeader {
    /// Raw header JSON exactly as stored. This is what Electron hashes.
    pub json: String,
    /// Absolute offset of the first byte of file data.
    pub data_offset: u64,
}

fn archive_err(path: &Path, reason: impl Into<String>) -> PatchError {
    PatchError::Archive {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn u32_at(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Read only the header of an archive.
pub fn read_header(path: &Path) -> PatchResult<AsarHeader> {
    let mut file = File::open(path).map_err(|e| PatchError::fs(path, e))?;
    let file_len = file.metadata().map_err(|e| PatchError::fs(path, e))?.len();

    let mut prefix = [0u8; 16];
    file.read_exact(&mut prefix)
        .map_err(|_| archive_err(path, "file too short for asar header"))?;

    if u32_at(&prefix, 0) != 4 {
        return Err(archive_err(path, "bad size pickle"));
    }
    let header_size = u32_at(&prefix, 4) as u64;
    let json_len = u32_at(&prefix, 12) as u64;

    if 16 + json_len > file_len || json_len + 8 > header_size {
        return Err(archive_err(
            path,
            format!("header length {} exceeds archive size {}", json_len, file_len),
        ));
    }

    let mut json = vec![0u8; json_len as usize];
    file.read_exact(&mut json).map_err(|e| PatchError::fs(path, e))?;
    let json = String::from_utf8(json).map_err(|_| archive_err(path, "header is not UTF-8"))?;

    Ok(AsarHeader {
        json,
        data_offset: 8 + header_size,
    })
}

impl AsarHeader {
    /// Read a single packed file, e.g. `package.json` or `dist/main.js`.
    pub fn read_file(&self, archive: &Path, inner: &str) -> PatchResult<Vec<u8>> {
        let root: Value = serde_json::from_str(&self.json)
            .map_err(|e| archive_err(archive, format!("header JSON: {}", e)))?;

        let mut node = &root;
        for part in inner.split('/').filter(|p| !p.is_empty()) {
            node = node
                .get("files")
                .and_then(|files| files.get(part))
                .ok_or_else(|| PatchError::NotFound {
                    what: format!("{} in {}", inner, archive.display()),
                })?;
        }

        if node.get("unpacked").and_then(Value::as_bool) == Some(true) {
            return Err(archive_err(archive, format!("{} is stored unpacked", inner)));
        }

        let size = node
            .get("size")
            .and_then(Value::as_u64)
            .ok_or_else(|| archive_err(archive, format!("{} has no size", inner)))?;
        let offset: u64 = node
            .get("offset")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| archive_err(archive, format!("{} has no offset", inner)))?;

        let mut file = File::open(archive).map_err(|e| PatchError::fs(archive, e))?;
        let file_len = file.metadata().map_err(|e| PatchError::fs(archive, e))?.len();

        // Bounds come from the header, so check them before allocating
        let start = self
            .data_offset
            .checked_add(offset)
            .filter(|start| start.checked_add(size).map_or(false, |end| end <= file_len))
            .ok_or_else(|| archive_err(archive, format!("{} lies outside the archive", inner)))?;

        file.seek(SeekFrom::Start(start))
            .map_err(|e| PatchError::fs(archive, e))?;
        let mut data = vec![0u8; size as usize];
        file.read_exact(&mut data)
            .map_err(|_| archive_err(archive, format!("{} is truncated", inner)))?;

        Ok(data)
    }
}

/// Builds small archives for tests in this crate.
#[cfg(test)]
pub(crate) mod testutil {
    use serde_json::{json, Map, Value};

    /// Pack flat files into an asar image.
    pub fn build(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut entries = Map::new();
        let mut data = Vec::new();
        for (name, content) in files {
            entries.insert(
                name.to_string(),
                json!({ "size": content.len(), "offset": data.len().to_string() }),
            );
            data.extend_from_slice(content);
        }
        let json = serde_json::to_string(&json!({ "files": Value::Object(entries) })).unwrap();
        with_header(&json, &data)
    }

    /// An image with a hand-written header JSON.
    pub fn with_header(json: &str, data: &[u8]) -> Vec<u8> {
        let padded = (json.len() + 3) & !3;
        let payload_size = 4 + padded;
        let header_size = 4 + payload_size;

        let mut out = Vec::new();
        out.extend_from_slice(&4u32.to_le_bytes());
        out.extend_from_slice(&(header_size as u32).to_le_bytes());
        out.extend_from_slice(&(payload_size as u32).to_le_bytes());
        out.extend_from_slice(&(json.len() as u32).to_le_bytes());
        out.extend_from_slice(json.as_bytes());
        out.resize(16 + padded, 0);
        out.extend_from_slice(data);
        out
    }

    /// An archive of roughly `len` bytes with a `package.json` and filler.
    pub fn sized(version: &str, len: usize) -> Vec<u8> {
        let pkg = format!(r#"{{"name":"sidekick","productName":"Sidekick","version":"{}"}}"#, version);
        let mut filler = 0usize;
        for _ in 0..8 {
            let image = build(&[("package.json", pkg.as_bytes()), ("filler.bin", &vec![7u8; filler])]);
            if image.len() == len {
                return image;
            }
            filler = (filler as i64 + len as i64 - image.len() as i64).max(0) as usize;
        }
        build(&[("package.json", pkg.as_bytes()), ("filler.bin", &vec![7u8; filler])])
    }
}
