// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Reconstruction of transfers delivered as a sequence-tagged byte stream.
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

use super::{deliver, move_file, output_path, remove_quietly, scratch_path, FinalizeContext};
use crate::constants::{CHUNK_TRAILER, OUT_OF_ORDER_WINDOW, SNIFF_FRAGMENT_LIMIT};
use crate::content_range::ContentRange;
use crate::decode::{decompressor, Base64Decoder, ChunkedReader};
use crate::errors::{Error, Result};
use crate::flow::{Direction, Flow, TransferKey};
use crate::magic::sniff_extension;
use crate::metrics::{FRAGMENTS_DROPPED, FRAGMENTS_RECEIVED};
use crate::multipart::parse_multipart_form_data;
use crate::reconstructed_file::{ReconstructedFile, TransferOrigin};
use crate::sanitize::{sanitize_filename_and_location, unique_path};
use crate::session::Session;
use crate::sink::HeaderSink;
use crate::transfer::{AssemblyRoot, ContentEncoding, TransferType};

const SNIFF_HEADER_LEN: usize = 512;

/// Outcome of handing a fragment to a stream assembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Stored, more data expected.
    Buffered,
    /// Empty payload, repeated sequence number or inactive assembler.
    Ignored,
    /// Rejected and reported as an anomaly.
    Dropped,
    /// The last byte arrived, the assembler should be finished.
    Complete,
    /// The remaining-byte counter ran out without a declared total. No more data is accepted.
    Deactivated,
}

/// A builder for constructing FileStreamAssembler instances.
pub struct FileStreamAssemblerBuilder {
    flow: Flow,
    direction: Direction,
    transfer_type: TransferType,
    filename: String,
    location: String,
    content_length: Option<u64>,
    content_range: Option<ContentRange>,
    details: String,
    extended_file_id: Option<String>,
    frame_number: u64,
    timestamp: DateTime<Utc>,
    root: AssemblyRoot,
    content_encoding: ContentEncoding,
    content_type: Option<String>,
}

impl FileStreamAssemblerBuilder {
    pub fn new(flow: Flow, direction: Direction, transfer_type: TransferType) -> Self {
        Self {
            flow,
            direction,
            transfer_type,
            filename: String::new(),
            location: String::new(),
            content_length: None,
            content_range: None,
            details: String::new(),
            extended_file_id: None,
            frame_number: 0,
            timestamp: Utc::now(),
            root: AssemblyRoot::Source,
            content_encoding: ContentEncoding::Identity,
            content_type: None,
        }
    }

    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    pub fn content_length(mut self, length: u64) -> Self {
        self.content_length = Some(length);
        self
    }

    pub fn content_range(mut self, range: ContentRange) -> Self {
        self.content_range = Some(range);
        self
    }

    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    pub fn extended_file_id(mut self, id: impl Into<String>) -> Self {
        self.extended_file_id = Some(id.into());
        self
    }

    pub fn frame(mut self, frame_number: u64, timestamp: DateTime<Utc>) -> Self {
        self.frame_number = frame_number;
        self.timestamp = timestamp;
        self
    }

    pub fn root(mut self, root: AssemblyRoot) -> Self {
        self.root = root;
        self
    }

    pub fn content_encoding(mut self, encoding: ContentEncoding) -> Self {
        self.content_encoding = encoding;
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn build(self, session: &Session) -> FileStreamAssembler {
        let key = TransferKey::new(&self.flow, self.direction, self.extended_file_id.as_deref());
        let origin = TransferOrigin {
            flow: self.flow,
            direction: self.direction,
            transfer_type: self.transfer_type,
            details: self.details,
            frame_number: self.frame_number,
            timestamp: self.timestamp,
        };
        FileStreamAssembler {
            scratch: scratch_path(session, &origin),
            origin,
            key,
            filename: self.filename,
            location: self.location,
            content_length: self.content_length,
            content_range: self.content_range,
            root: self.root,
            content_encoding: self.content_encoding,
            content_type: self.content_type,
            sink: None,
            buffer: BTreeMap::new(),
            seen: HashSet::new(),
            received: 0,
            remaining: None,
            sniffed_extension: None,
            active: false,
            finished: false,
        }
    }
}

pub struct FileStreamAssembler {
    origin: TransferOrigin,
    key: TransferKey,
    filename: String,
    location: String,
    content_length: Option<u64>,
    content_range: Option<ContentRange>,
    root: AssemblyRoot,
    content_encoding: ContentEncoding,
    content_type: Option<String>,
    scratch: PathBuf,
    sink: Option<HeaderSink<BufWriter<File>>>,
    buffer: BTreeMap<u64, Vec<u8>>,
    seen: HashSet<u64>,
    received: u64,
    remaining: Option<u64>,
    sniffed_extension: Option<&'static str>,
    active: bool,
    finished: bool,
}

fn sniff_file(path: &Path) -> Option<&'static str> {
    let mut header = Vec::with_capacity(SNIFF_HEADER_LEN);
    File::open(path)
        .ok()?
        .take(SNIFF_HEADER_LEN as u64)
        .read_to_end(&mut header)
        .ok()?;
    sniff_extension(&header)
}

fn write_decoded(mut reader: impl Read, output: &Path) -> Result<()> {
    let mut file = BufWriter::new(File::create(output)?);
    io::copy(&mut reader, &mut file).map_err(|e| Error::Decode(e.to_string()))?;
    file.flush()?;
    Ok(())
}

impl FileStreamAssembler {
    pub fn key(&self) -> &TransferKey {
        &self.key
    }

    pub fn origin(&self) -> &TransferOrigin {
        &self.origin
    }

    pub fn transfer_type(&self) -> TransferType {
        self.origin.transfer_type
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn received_bytes(&self) -> u64 {
        self.received
    }

    pub fn buffered_fragments(&self) -> usize {
        self.buffer.len()
    }

    pub fn sniffed_extension(&self) -> Option<&'static str> {
        self.sniffed_extension
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn scratch_path(&self) -> &Path {
        &self.scratch
    }

    /// Sanitized (filename, location) as they would be written now, without defanging.
    pub fn sanitized_name(&self) -> (String, String) {
        sanitize_filename_and_location(
            &self.filename,
            &self.location,
            self.sniffed_extension,
            false,
        )
    }

    /// Opens the scratch file. Data is only accepted once this succeeded.
    pub fn try_activate(&mut self, session: &Session) -> io::Result<()> {
        if self.sink.is_some() || self.finished {
            return Ok(());
        }
        fs::create_dir_all(session.cache_dir())?;
        let file = File::create(&self.scratch)?;
        session.scratch_files().track(&self.scratch);
        self.sink = Some(HeaderSink::new(BufWriter::new(file), 0)?);
        self.active = true;
        trace!("activated {} at {}", self.key, self.scratch.display());
        Ok(())
    }

    pub fn set_filename(&mut self, filename: &str, location: &str) {
        self.filename = filename.to_string();
        self.location = location.to_string();
    }

    /// Corrects the declared length, e.g. once a header carrying it has been parsed.
    pub fn set_content_length(&mut self, length: u64) {
        self.content_length = Some(length);
    }

    /// Number of bytes still expected for the current protocol unit.
    pub fn set_remaining_bytes(&mut self, remaining: u64) {
        self.remaining = Some(remaining);
    }

    fn flush_lowest(&mut self, keep: usize) -> io::Result<()> {
        let Some(sink) = self.sink.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "scratch file is not open",
            ));
        };
        while self.buffer.len() > keep {
            let Some((_, fragment)) = self.buffer.pop_first() else {
                break;
            };
            sink.write_all(&fragment)?;
        }
        Ok(())
    }

    fn drop_fragment(&self) {
        FRAGMENTS_DROPPED
            .with_label_values(&[self.origin.transfer_type.protocol_dir()])
            .inc();
    }

    pub fn add_data(&mut self, session: &Session, data: &[u8], sequence: u64) -> Progress {
        if !self.active || data.is_empty() {
            return Progress::Ignored;
        }
        if self.seen.contains(&sequence) {
            self.drop_fragment();
            return Progress::Ignored;
        }
        let traits = self.origin.transfer_type.traits();
        let length = data.len() as u64;
        if let Some(total) = self.content_length {
            if !traits.segment_length_every_write && self.received + length > total {
                self.drop_fragment();
                session.report_anomaly(&format!(
                    "{}: {length} more bytes would exceed the declared length of {total} ({} received)",
                    self.key, self.received
                ));
                return Progress::Dropped;
            }
        }

        self.seen.insert(sequence);
        self.buffer.insert(sequence, data.to_vec());
        self.received += length;
        FRAGMENTS_RECEIVED
            .with_label_values(&[traits.protocol_dir])
            .inc();

        if self.sniffed_extension.is_none() && self.buffer.len() < SNIFF_FRAGMENT_LIMIT {
            if let Some((_, first)) = self.buffer.first_key_value() {
                self.sniffed_extension = sniff_extension(first);
            }
        }

        if self.buffer.len() > OUT_OF_ORDER_WINDOW {
            if let Err(e) = self.flush_lowest(OUT_OF_ORDER_WINDOW) {
                session.report_io_error(&self.scratch, "error writing", &e);
                self.active = false;
                return Progress::Dropped;
            }
        }

        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(length);
            if *remaining == 0
                && self.content_length.is_none()
                && !traits.segment_length_every_write
            {
                debug!("{}: no bytes remaining, deactivating", self.key);
                self.active = false;
                return Progress::Deactivated;
            }
        }

        if self.origin.transfer_type.is_chunked() {
            if data.ends_with(CHUNK_TRAILER) {
                return Progress::Complete;
            }
        } else if !traits.owns_completion && self.content_length == Some(self.received) {
            return Progress::Complete;
        }
        Progress::Buffered
    }

    fn close_scratch(&mut self) -> io::Result<()> {
        self.flush_lowest(0)?;
        let Some(sink) = self.sink.take() else {
            return Ok(());
        };
        sink.finish(|_| Vec::new())?
            .into_inner()
            .map_err(|e| e.into_error())?;
        Ok(())
    }

    /// Flushes everything still buffered, writes the final file and reports it. Every failure is
    /// reported through the session and ends with the scratch file removed.
    pub fn finish(&mut self, ctx: &mut FinalizeContext<'_>) -> Vec<ReconstructedFile> {
        if self.finished {
            return Vec::new();
        }
        self.active = false;
        self.finished = true;
        let session = ctx.session;

        let closed = self.close_scratch();
        session.scratch_files().release(&self.scratch);
        if let Err(e) = closed {
            session.report_io_error(&self.scratch, "error closing", &e);
            remove_quietly(&self.scratch);
            return Vec::new();
        }

        let emitted = match self.finalize(ctx) {
            Ok(emitted) => emitted,
            Err(Error::IoError(e)) => {
                session.report_io_error(&self.scratch, "error assembling", &e);
                Vec::new()
            }
            Err(e) => {
                session.report_anomaly(&format!("error assembling {}: {e}", self.key));
                Vec::new()
            }
        };
        remove_quietly(&self.scratch);
        emitted
    }

    /// Undoes the transfer and content encodings into a file next to the scratch file. Returns
    /// `None` when the scratch file already holds the final bytes.
    fn decode(&self, decompress: bool) -> Result<Option<PathBuf>> {
        let decoded = self.scratch.with_extension("decoded");
        let scratch = || -> Result<BufReader<File>> { Ok(BufReader::new(File::open(&self.scratch)?)) };
        let result = if self.origin.transfer_type.is_chunked() {
            let chunks = ChunkedReader::new(scratch()?);
            if decompress {
                let reader = decompressor(self.content_encoding, BufReader::new(chunks))?;
                write_decoded(reader, &decoded)
            } else {
                write_decoded(chunks, &decoded)
            }
        } else if decompress {
            write_decoded(decompressor(self.content_encoding, scratch()?)?, &decoded)
        } else if self.content_encoding == ContentEncoding::Base64 {
            write_decoded(Base64Decoder::new(scratch()?), &decoded)
        } else {
            return Ok(None);
        };
        match result {
            Ok(()) => Ok(Some(decoded)),
            Err(e) => {
                remove_quietly(&decoded);
                Err(e)
            }
        }
    }

    fn finalize(&mut self, ctx: &mut FinalizeContext<'_>) -> Result<Vec<ReconstructedFile>> {
        let session = ctx.session;
        let config = session.config();
        let decompress = self.content_encoding.is_compressed() && config.decompress_gzip_streams;

        if self.origin.transfer_type == TransferType::HttpPostMimeMultipartFormData && !decompress {
            return self.demultiplex(ctx);
        }

        let (source, sniffed) = match self.decode(decompress)? {
            Some(decoded) => {
                let sniffed = sniff_file(&decoded);
                (decoded, sniffed)
            }
            None => (self.scratch.clone(), self.sniffed_extension),
        };
        let placed = (|| -> Result<(PathBuf, PathBuf)> {
            let (filename, location) = sanitize_filename_and_location(
                &self.filename,
                &self.location,
                sniffed,
                config.defang_executable_files,
            );
            let intended = output_path(session, &self.origin, self.root, &location, &filename)?;
            let destination = unique_path(&intended);
            move_file(&source, &destination)?;
            Ok((intended, destination))
        })();
        remove_quietly(&source);
        let (intended, destination) = placed?;
        debug!("assembled {} into {}", self.key, destination.display());

        let file = ReconstructedFile::new(
            session.output_dir(),
            destination,
            self.origin.clone(),
            sniffed.map(str::to_string),
        )?;
        Ok(deliver(ctx, file, self.content_range, &intended))
    }

    /// Splits a form upload into its parts. Form fields go to the application, every file part
    /// is assembled by a child assembler that shares this one's context.
    fn demultiplex(&mut self, ctx: &mut FinalizeContext<'_>) -> Result<Vec<ReconstructedFile>> {
        let session = ctx.session;
        let body = fs::read(&self.scratch)?;
        let parts = parse_multipart_form_data(&body, self.content_type.as_deref().unwrap_or(""))?;
        session.events().extract_multipart_form_data(
            &parts,
            &self.origin.flow,
            self.origin.direction,
            self.origin.timestamp,
            self.origin.frame_number,
            self.origin.transfer_type,
        );

        let mut emitted = Vec::new();
        for part in parts.iter().filter(|p| p.is_file()) {
            let mut builder = FileStreamAssemblerBuilder::new(
                self.origin.flow.clone(),
                self.origin.direction,
                TransferType::HttpPostMimeFileData,
            )
            .filename(part.filename.clone().unwrap_or_default())
            .location(self.location.clone())
            .content_length(part.data.len() as u64)
            .details(self.origin.details.clone())
            .frame(self.origin.frame_number, self.origin.timestamp)
            .root(self.root)
            .content_encoding(part.content_encoding);
            if let Some(content_type) = &part.content_type {
                builder = builder.content_type(content_type.clone());
            }
            let mut child = builder.build(session);
            if let Err(e) = child.try_activate(session) {
                session.report_io_error(child.scratch_path(), "error creating", &e);
                continue;
            }
            child.add_data(session, &part.data, 0);
            emitted.extend(child.finish(ctx));
        }
        Ok(emitted)
    }

    /// Throws away buffered data and the scratch file.
    pub fn clear(&mut self, session: &Session) {
        self.buffer.clear();
        self.sink = None;
        self.active = false;
        self.finished = true;
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
    use std::sync::Arc;
    use tempfile::tempdir;

    fn flow() -> Flow {
        Flow::new(
            Transport::Tcp,
            "10.0.0.1:50000".parse().unwrap(),
            "10.0.0.2:80".parse().unwrap(),
        )
    }

    fn finish(session: &Arc<Session>, assembler: &mut FileStreamAssembler) -> Vec<ReconstructedFile> {
        let mut partials = BoundedMap::new(8);
        let mut ctx = FinalizeContext {
            session,
            partials: &mut partials,
        };
        assembler.finish(&mut ctx)
    }

    #[test]
    fn test_inactive_assembler_ignores_data() {
        let dir = tempdir().unwrap();
        let (session, _) = recording_session(dir.path());
        let mut assembler =
            FileStreamAssemblerBuilder::new(flow(), Direction::ServerToClient, TransferType::Ftp)
                .filename("a.txt")
                .build(&session);
        assert_eq!(assembler.add_data(&session, b"abc", 0), Progress::Ignored);
        assembler.try_activate(&session).unwrap();
        assert_eq!(assembler.add_data(&session, b"", 1), Progress::Ignored);
        assert_eq!(assembler.add_data(&session, b"abc", 1), Progress::Buffered);
        assert_eq!(assembler.add_data(&session, b"xyz", 1), Progress::Ignored);
        assert_eq!(assembler.received_bytes(), 3);
        assert_eq!(session.scratch_files().len(), 1);
        assembler.clear(&session);
        assert!(session.scratch_files().is_empty());
        assert!(!assembler.scratch_path().exists());
    }

    #[test]
    fn test_overflow_is_dropped_with_anomaly() {
        let dir = tempdir().unwrap();
        let (session, events) = recording_session(dir.path());
        let mut assembler = FileStreamAssemblerBuilder::new(
            flow(),
            Direction::ServerToClient,
            TransferType::HttpGetNormal,
        )
        .content_length(4)
        .build(&session);
        assembler.try_activate(&session).unwrap();
        assert_eq!(assembler.add_data(&session, b"abc", 10), Progress::Buffered);
        assert_eq!(assembler.add_data(&session, b"def", 13), Progress::Dropped);
        assert_eq!(events.anomalies.lock().len(), 1);
        assert_eq!(assembler.add_data(&session, b"d", 13), Progress::Complete);
    }

    #[test]
    fn test_remaining_bytes_deactivate() {
        let dir = tempdir().unwrap();
        let (session, _) = recording_session(dir.path());
        let mut assembler =
            FileStreamAssemblerBuilder::new(flow(), Direction::ServerToClient, TransferType::Ftp)
                .filename("listing.txt")
                .build(&session);
        assembler.try_activate(&session).unwrap();
        assembler.set_remaining_bytes(6);
        assert_eq!(assembler.add_data(&session, b"abc", 0), Progress::Buffered);
        assert_eq!(assembler.add_data(&session, b"def", 3), Progress::Deactivated);
        assert!(!assembler.is_active());
        assert_eq!(assembler.add_data(&session, b"ghi", 6), Progress::Ignored);

        let emitted = finish(&session, &mut assembler);
        assert_eq!(emitted.len(), 1);
        assert_eq!(fs::read(emitted[0].path()).unwrap(), b"abcdef");
    }

    #[test]
    fn test_window_overflow_flushes_lowest_in_arrival_order() {
        let dir = tempdir().unwrap();
        let (session, _) = recording_session(dir.path());
        let mut assembler =
            FileStreamAssemblerBuilder::new(flow(), Direction::ServerToClient, TransferType::Ftp)
                .filename("window.bin")
                .build(&session);
        assembler.try_activate(&session).unwrap();
        // sequence 0 arrives after the window has already been flushed past it
        for seq in 1..=(OUT_OF_ORDER_WINDOW as u64 + 1) {
            assembler.add_data(&session, &[seq as u8], seq);
        }
        assert_eq!(assembler.buffered_fragments(), OUT_OF_ORDER_WINDOW);
        assembler.add_data(&session, &[0], 0);

        let emitted = finish(&session, &mut assembler);
        let bytes = fs::read(emitted[0].path()).unwrap();
        assert_eq!(bytes.len(), OUT_OF_ORDER_WINDOW + 2);
        assert_eq!(bytes[0], 1);
    }

    #[test]
    fn test_base64_and_gzip_finalize() {
        use flate2::write::GzEncoder;
        use flate2::Compression;

        let dir = tempdir().unwrap();
        let (session, _) = recording_session(dir.path());

        let mut assembler =
            FileStreamAssemblerBuilder::new(flow(), Direction::ServerToClient, TransferType::Smtp)
                .filename("note.txt")
                .content_encoding(ContentEncoding::Base64)
                .build(&session);
        assembler.try_activate(&session).unwrap();
        assembler.add_data(&session, b"aGVsbG8g\r\n", 0);
        assembler.add_data(&session, b"d29ybGQ=\r\n", 10);
        let emitted = finish(&session, &mut assembler);
        assert_eq!(fs::read(emitted[0].path()).unwrap(), b"hello world");

        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(b"GIF89a compressed").unwrap();
        let gz = gz.finish().unwrap();
        let mut assembler = FileStreamAssemblerBuilder::new(
            flow(),
            Direction::ServerToClient,
            TransferType::HttpGetNormal,
        )
        .filename("image")
        .content_length(gz.len() as u64)
        .content_encoding(ContentEncoding::Gzip)
        .build(&session);
        assembler.try_activate(&session).unwrap();
        assert_eq!(assembler.add_data(&session, &gz, 0), Progress::Complete);
        let emitted = finish(&session, &mut assembler);
        assert_eq!(emitted[0].filename(), "image.gif");
        assert_eq!(fs::read(emitted[0].path()).unwrap(), b"GIF89a compressed");
    }

    #[test]
    fn test_corrupt_encoding_is_an_anomaly() {
        let dir = tempdir().unwrap();
        let (session, events) = recording_session(dir.path());
        let mut assembler = FileStreamAssemblerBuilder::new(
            flow(),
            Direction::ServerToClient,
            TransferType::HttpGetChunked,
        )
        .filename("broken")
        .build(&session);
        assembler.try_activate(&session).unwrap();
        assembler.add_data(&session, b"zz\r\nnot a chunk\r\n", 0);
        let emitted = finish(&session, &mut assembler);
        assert!(emitted.is_empty());
        assert_eq!(events.anomalies.lock().len(), 1);
        assert!(!assembler.scratch_path().exists());
        assert!(!assembler.scratch_path().with_extension("decoded").exists());
    }
}
