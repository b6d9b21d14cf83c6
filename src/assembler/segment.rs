// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Reconstruction of transfers whose fragments carry an absolute file offset.
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, trace};

use super::{deliver, move_file, output_path, remove_quietly, scratch_path, FinalizeContext};
use crate::content_range::ContentRange;
use crate::decode::decompressor;
use crate::flow::{Direction, Flow, TransferKey};
use crate::metrics::FRAGMENTS_RECEIVED;
use crate::reconstructed_file::{ReconstructedFile, TransferOrigin};
use crate::sanitize::{sanitize_filename_and_location, unique_path};
use crate::session::Session;
use crate::transfer::{AssemblyRoot, ContentEncoding, TransferType};

#[derive(Error, Debug)]
pub enum SegmentError {
    #[error("segment {offset}+{length} exceeds the declared size of {declared} bytes")]
    ExceedsDeclaredSize {
        offset: u64,
        length: u64,
        declared: u64,
    },

    #[error("segment assembler for {0} is already closed")]
    Closed(String),

    #[error("scratch file error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentProgress {
    Incomplete { covered: u64 },
    Complete,
}

pub struct FileSegmentAssembler {
    origin: TransferOrigin,
    key: TransferKey,
    filename: String,
    location: String,
    segment_size: u64,
    root: AssemblyRoot,
    content_encoding: ContentEncoding,
    content_range: Option<ContentRange>,
    scratch: PathBuf,
    file: Option<File>,
    position: u64,
    coverage: BTreeMap<u64, u64>,
    closed: bool,
}

impl FileSegmentAssembler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: &Session,
        flow: Flow,
        direction: Direction,
        transfer_type: TransferType,
        filename: &str,
        location: &str,
        segment_size: u64,
        details: &str,
        extended_file_id: Option<&str>,
        frame_number: u64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let key = TransferKey::new(&flow, direction, extended_file_id);
        let origin = TransferOrigin {
            flow,
            direction,
            transfer_type,
            details: details.to_string(),
            frame_number,
            timestamp,
        };
        Self {
            scratch: scratch_path(session, &origin),
            origin,
            key,
            filename: filename.to_string(),
            location: location.to_string(),
            segment_size,
            root: AssemblyRoot::Source,
            content_encoding: ContentEncoding::Identity,
            content_range: None,
            file: None,
            position: 0,
            coverage: BTreeMap::new(),
            closed: false,
        }
    }

    pub fn with_root(mut self, root: AssemblyRoot) -> Self {
        self.root = root;
        self
    }

    pub fn with_content_encoding(mut self, encoding: ContentEncoding) -> Self {
        self.content_encoding = encoding;
        self
    }

    /// Marks the assembled file as one range of a larger file.
    pub fn with_content_range(mut self, range: ContentRange) -> Self {
        self.content_range = Some(range);
        self
    }

    pub fn key(&self) -> &TransferKey {
        &self.key
    }

    pub fn origin(&self) -> &TransferOrigin {
        &self.origin
    }

    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    pub fn scratch_path(&self) -> &Path {
        &self.scratch
    }

    /// Bytes covered contiguously from offset 0.
    pub fn covered(&self) -> u64 {
        let mut next = 0u64;
        for (start, length) in &self.coverage {
            if *start > next {
                break;
            }
            next = next.max(start + length);
        }
        next
    }

    fn open(&mut self, session: &Session) -> io::Result<&mut File> {
        match self.file {
            Some(ref mut file) => Ok(file),
            None => {
                fs::create_dir_all(session.cache_dir())?;
                let file = File::create(&self.scratch)?;
                session.scratch_files().track(&self.scratch);
                self.position = 0;
                Ok(self.file.insert(file))
            }
        }
    }

    /// Writes `data` at `offset`. Rewriting an offset keeps the longer of the two writes in the
    /// coverage accounting.
    pub fn add_data(
        &mut self,
        session: &Session,
        offset: u64,
        data: &[u8],
        frame_number: u64,
    ) -> Result<SegmentProgress, SegmentError> {
        if self.closed {
            return Err(SegmentError::Closed(self.key.to_string()));
        }
        let length = data.len() as u64;
        if offset.saturating_add(length) > self.segment_size {
            return Err(SegmentError::ExceedsDeclaredSize {
                offset,
                length,
                declared: self.segment_size,
            });
        }
        if data.is_empty() {
            return Ok(SegmentProgress::Incomplete {
                covered: self.covered(),
            });
        }

        let position = self.position;
        let file = self.open(session)?;
        if position != offset {
            file.seek(SeekFrom::Start(offset))?;
        }
        file.write_all(data)?;
        self.position = offset + length;
        FRAGMENTS_RECEIVED
            .with_label_values(&[self.origin.transfer_type.protocol_dir()])
            .inc();
        trace!("{}: {length} bytes at {offset} from frame {frame_number}", self.key);

        let stored = self.coverage.entry(offset).or_insert(0);
        *stored = (*stored).max(length);

        let covered = self.covered();
        if covered == self.segment_size {
            Ok(SegmentProgress::Complete)
        } else {
            Ok(SegmentProgress::Incomplete { covered })
        }
    }

    fn finalize(&mut self, session: &Session) -> crate::errors::Result<(PathBuf, PathBuf)> {
        let (filename, location) = sanitize_filename_and_location(
            &self.filename,
            &self.location,
            None,
            session.config().defang_executable_files,
        );
        let intended = output_path(session, &self.origin, self.root, &location, &filename)?;
        let destination = unique_path(&intended);
        if !self.scratch.exists() {
            // zero-length file, nothing was ever written
            fs::create_dir_all(session.cache_dir())?;
            File::create(&self.scratch)?;
        }
        if self.content_encoding == ContentEncoding::Gzip
            && session.config().decompress_gzip_streams
        {
            let scratch = BufReader::new(File::open(&self.scratch)?);
            let mut reader = decompressor(ContentEncoding::Gzip, scratch)?;
            let mut output = File::create(&destination)?;
            if let Err(e) = io::copy(&mut reader, &mut output) {
                drop(output);
                remove_quietly(&destination);
                return Err(e.into());
            }
        } else {
            move_file(&self.scratch, &destination)?;
        }
        Ok((intended, destination))
    }

    /// Closes the scratch file and writes the final file. Errors are reported through the
    /// session; the assembler is closed either way.
    pub fn assemble_and_close(&mut self, ctx: &mut FinalizeContext<'_>) -> Vec<ReconstructedFile> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;
        let session = ctx.session;
        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.flush() {
                session.report_io_error(&self.scratch, "error closing", &e);
            }
        }
        session.scratch_files().release(&self.scratch);

        let finalized = self.finalize(session);
        remove_quietly(&self.scratch);
        let (intended, destination) = match finalized {
            Ok(paths) => paths,
            Err(e) => {
                session.report_anomaly(&format!("error assembling {}: {e}", self.key));
                return Vec::new();
            }
        };
        debug!("assembled {} into {}", self.key, destination.display());
        match ReconstructedFile::new(
            session.output_dir(),
            destination.clone(),
            self.origin.clone(),
            None,
        ) {
            Ok(file) => deliver(ctx, file, self.content_range, &intended),
            Err(e) => {
                session.report_io_error(&destination, "error reading", &e);
                Vec::new()
            }
        }
    }

    /// Drops the scratch file without producing output.
    pub fn clear(&mut self, session: &Session) {
        self.file = None;
        self.coverage.clear();
        session.scratch_files().release(&self.scratch);
        remove_quietly(&self.scratch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounded_map::BoundedMap;
    use crate::flow::Transport;
    use crate::session::testing::recording_session;
    use std::fs;
    use tempfile::tempdir;

    fn assembler(session: &Session, size: u64) -> FileSegmentAssembler {
        FileSegmentAssembler::new(
            session,
            Flow::new(
                Transport::Tcp,
                "10.0.0.1:49152".parse().unwrap(),
                "10.0.0.2:445".parse().unwrap(),
            ),
            Direction::ServerToClient,
            TransferType::Smb2,
            "share\\report.pdf",
            "",
            size,
            "\\\\server\\share\\report.pdf",
            Some("fid-1"),
            1,
            Utc::now(),
        )
    }

    #[test]
    fn test_out_of_order_segments_complete() {
        let dir = tempdir().unwrap();
        let (session, _) = recording_session(dir.path());
        let mut segment = assembler(&session, 10);
        assert_eq!(
            segment.add_data(&session, 5, b"56789", 2).unwrap(),
            SegmentProgress::Incomplete { covered: 0 }
        );
        assert_eq!(
            segment.add_data(&session, 0, b"01234", 3).unwrap(),
            SegmentProgress::Complete
        );

        let mut partials = BoundedMap::new(4);
        let mut ctx = FinalizeContext {
            session: &session,
            partials: &mut partials,
        };
        let emitted = segment.assemble_and_close(&mut ctx);
        assert_eq!(emitted.len(), 1);
        assert_eq!(fs::read(emitted[0].path()).unwrap(), b"0123456789");
        assert_eq!(emitted[0].filename(), "report.pdf");
        assert!(emitted[0]
            .path()
            .starts_with(dir.path().join("SMB2").join("10.0.0.2").join("TCP-445").join("share")));
        assert!(!segment.scratch_path().exists());
    }

    #[test]
    fn test_duplicate_offset_keeps_longer_write() {
        let dir = tempdir().unwrap();
        let (session, _) = recording_session(dir.path());
        let mut segment = assembler(&session, 8);
        segment.add_data(&session, 0, b"abcdef", 1).unwrap();
        segment.add_data(&session, 0, b"ab", 2).unwrap();
        assert_eq!(segment.covered(), 6);
        assert_eq!(
            segment.add_data(&session, 6, b"gh", 3).unwrap(),
            SegmentProgress::Complete
        );
    }

    #[test]
    fn test_overflow_is_a_typed_error() {
        let dir = tempdir().unwrap();
        let (session, _) = recording_session(dir.path());
        let mut segment = assembler(&session, 4);
        let err = segment.add_data(&session, 2, b"xyz", 1).unwrap_err();
        assert!(matches!(
            err,
            SegmentError::ExceedsDeclaredSize {
                offset: 2,
                length: 3,
                declared: 4
            }
        ));
        segment.clear(&session);
        assert!(session.scratch_files().is_empty());
    }
}
