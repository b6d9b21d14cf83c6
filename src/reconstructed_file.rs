// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Descriptor of a file that has been completely written to disk.
use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use url::Url;

use crate::constants::COPY_BUFFER_SIZE;
use crate::flow::{Direction, Flow};
use crate::magic::ICO_MAGIC;
use crate::sanitize::split_extension;
use crate::transfer::TransferType;

const IMAGE_EXTENSIONS: [&str; 10] = [
    "jpg", "jpeg", "gif", "png", "bmp", "ico", "tif", "tiff", "webp", "svg",
];

/// Where a file came from: the session, the protocol and the frame that started it.
#[derive(Debug, Clone, Serialize)]
pub struct TransferOrigin {
    pub flow: Flow,
    pub direction: Direction,
    pub transfer_type: TransferType,
    pub details: String,
    pub frame_number: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconstructedFile {
    path: PathBuf,
    relative_uri: Option<String>,
    #[serde(flatten)]
    origin: TransferOrigin,
    extension_from_header: Option<String>,
    size: u64,
    #[serde(skip)]
    hash: OnceCell<String>,
}

fn relative_uri(output_root: &Path, path: &Path) -> Option<String> {
    let root = std::path::absolute(output_root).ok()?;
    let path = std::path::absolute(path).ok()?;
    if !path.starts_with(&root) {
        return None;
    }
    let root_url = Url::from_directory_path(&root).ok()?;
    let file_url = Url::from_file_path(&path).ok()?;
    root_url.make_relative(&file_url)
}

fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

impl ReconstructedFile {
    /// Builds the descriptor of a completely written file. The size is read from the
    /// filesystem here and never again, so calling this before writing is done is a bug.
    pub fn new(
        output_root: &Path,
        path: PathBuf,
        origin: TransferOrigin,
        extension_from_header: Option<String>,
    ) -> io::Result<Self> {
        let size = std::fs::metadata(&path)?.len();
        Ok(Self {
            relative_uri: relative_uri(output_root, &path),
            path,
            origin,
            extension_from_header,
            size,
            hash: OnceCell::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn filename(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn relative_uri(&self) -> Option<&str> {
        self.relative_uri.as_deref()
    }

    pub fn origin(&self) -> &TransferOrigin {
        &self.origin
    }

    pub fn flow(&self) -> &Flow {
        &self.origin.flow
    }

    pub fn transfer_type(&self) -> TransferType {
        self.origin.transfer_type
    }

    pub fn details(&self) -> &str {
        &self.origin.details
    }

    pub fn extension_from_header(&self) -> Option<&str> {
        self.extension_from_header.as_deref()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Hex encoded SHA-256 of the file content, computed on first access.
    pub fn hash(&self) -> io::Result<&str> {
        self.hash
            .get_or_try_init(|| sha256_file(&self.path))
            .map(String::as_str)
    }

    /// Sniffed extension, falling back to the filename's extension.
    pub fn extension(&self) -> Option<String> {
        self.extension_from_header.clone().or_else(|| {
            let name = self.filename();
            split_extension(&name).map(|(_, ext)| ext.to_ascii_lowercase())
        })
    }

    pub fn is_image(&self) -> bool {
        self.extension()
            .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
    }

    pub fn is_icon(&self) -> bool {
        if let Some(ext) = self.extension() {
            if ext == "ico" {
                return true;
            }
            if self.extension_from_header.is_some() {
                return false;
            }
        }
        if !self.filename().to_ascii_lowercase().contains("favicon") {
            return false;
        }
        let mut head = [0u8; 4];
        File::open(&self.path)
            .and_then(|mut f| f.read_exact(&mut head))
            .map(|_| head == ICO_MAGIC)
            .unwrap_or(false)
    }

    pub fn is_multipart_form_data(&self) -> bool {
        self.extension().is_some_and(|ext| ext == "mime")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::Transport;
    use std::fs;
    use tempfile::tempdir;

    fn origin() -> TransferOrigin {
        TransferOrigin {
            flow: Flow::new(
                Transport::Tcp,
                "10.0.0.1:50000".parse().unwrap(),
                "10.0.0.2:80".parse().unwrap(),
            ),
            direction: Direction::ServerToClient,
            transfer_type: TransferType::HttpGetNormal,
            details: "http://example.com/".to_string(),
            frame_number: 1,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_size_hash_and_uri() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("HTTP").join("hello world.txt");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"abc").unwrap();

        let file = ReconstructedFile::new(dir.path(), path, origin(), None).unwrap();
        assert_eq!(file.size(), 3);
        assert_eq!(
            file.hash().unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(file.relative_uri(), Some("HTTP/hello%20world.txt"));
    }

    #[test]
    fn test_outside_root_has_no_uri() {
        let root = tempdir().unwrap();
        let other = tempdir().unwrap();
        let path = other.path().join("x.bin");
        fs::write(&path, b"x").unwrap();
        let file = ReconstructedFile::new(root.path(), path, origin(), None).unwrap();
        assert_eq!(file.relative_uri(), None);
    }

    #[test]
    fn test_classification() {
        let dir = tempdir().unwrap();

        let png = dir.path().join("logo.bin");
        fs::write(&png, b"data").unwrap();
        let file = ReconstructedFile::new(dir.path(), png, origin(), Some("png".into())).unwrap();
        assert!(file.is_image());
        assert!(!file.is_icon());

        let favicon = dir.path().join("favicon");
        fs::write(&favicon, [0x00, 0x00, 0x01, 0x00, 0x01]).unwrap();
        let file = ReconstructedFile::new(dir.path(), favicon, origin(), None).unwrap();
        assert!(file.is_icon());

        let form = dir.path().join("form.mime");
        fs::write(&form, b"--b\r\n").unwrap();
        let file = ReconstructedFile::new(dir.path(), form, origin(), None).unwrap();
        assert!(file.is_multipart_form_data());
        assert!(!file.is_image());
    }
}
