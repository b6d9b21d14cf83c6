// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Slicing embedded sub-files out of a completed reconstruction.
use serde::Serialize;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::metrics::FILES_CARVED;
use crate::reconstructed_file::ReconstructedFile;
use crate::sanitize::{sanitize_extension, split_extension, unique_path};
use crate::session::Session;

/// One embedded file inside a parent reconstruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CarvedRange {
    pub extension: String,
    pub start: u64,
    pub length: u64,
}

pub trait FileCarver: Send + Sync {
    fn carve(&self, file: &ReconstructedFile) -> Vec<CarvedRange>;
}

impl<F> FileCarver for F
where
    F: Fn(&ReconstructedFile) -> Vec<CarvedRange> + Send + Sync,
{
    fn carve(&self, file: &ReconstructedFile) -> Vec<CarvedRange> {
        self(file)
    }
}

fn carved_path(parent: &Path, start: u64, extension: Option<&str>) -> PathBuf {
    let name = parent
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = split_extension(&name).map_or(name.as_str(), |(stem, _)| stem);
    let carved = match extension {
        Some(ext) => format!("{stem}_{start}.{ext}"),
        None => format!("{stem}_{start}"),
    };
    unique_path(&parent.with_file_name(carved))
}

fn copy_range(source: &Path, destination: &Path, range: &CarvedRange) -> io::Result<()> {
    let mut input = File::open(source)?;
    input.seek(SeekFrom::Start(range.start))?;
    let mut output = File::create(destination)?;
    let copied = io::copy(&mut input.take(range.length), &mut output)?;
    if copied != range.length {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("copied {copied} of {} bytes", range.length),
        ));
    }
    Ok(())
}

/// Writes every range the carver reports as a sibling of `file` and reports them through the
/// session. Carved files are not carved again.
pub fn carve_file(
    session: &Session,
    file: &ReconstructedFile,
    carver: &dyn FileCarver,
) -> Vec<ReconstructedFile> {
    let mut carved = Vec::new();
    for range in carver.carve(file) {
        if range.length == 0 {
            continue;
        }
        if range.start.saturating_add(range.length) > file.size() {
            session.report_anomaly(&format!(
                "carved range {}+{} runs past the end of {} ({} bytes)",
                range.start,
                range.length,
                file.path().display(),
                file.size()
            ));
            continue;
        }
        let extension = sanitize_extension(&range.extension);
        let destination = carved_path(file.path(), range.start, extension.as_deref());
        if let Err(e) = copy_range(file.path(), &destination, &range) {
            session.report_io_error(&destination, "error carving", &e);
            continue;
        }
        match ReconstructedFile::new(
            session.output_dir(),
            destination.clone(),
            file.origin().clone(),
            extension,
        ) {
            Ok(child) => {
                debug!("carved {} from {}", destination.display(), file.path().display());
                FILES_CARVED.inc();
                session.events().on_reconstructed_file(&child);
                carved.push(child);
            }
            Err(e) => session.report_io_error(&destination, "error reading carved file", &e),
        }
    }
    carved
}
