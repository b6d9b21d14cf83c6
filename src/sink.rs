// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Byte sinks with a header that is written last, and the WAV writer built on top of them.
use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::PathBuf;
use tracing::debug;
use zerocopy::{byteorder::*, *};
use zerocopy_derive::*;

use crate::assembler::{move_file, output_path, remove_quietly, scratch_path};
use crate::errors::Result;
use crate::reconstructed_file::{ReconstructedFile, TransferOrigin};
use crate::sanitize::{sanitize_filename_and_location, unique_path};
use crate::session::Session;
use crate::transfer::AssemblyRoot;

/// Reserves `header_len` bytes at the start of `inner`, takes body bytes through `Write`, and
/// fills the header in once the body length is known.
pub struct HeaderSink<W: Write + Seek> {
    inner: W,
    header_len: usize,
    body_len: u64,
}

impl<W: Write + Seek> HeaderSink<W> {
    pub fn new(mut inner: W, header_len: usize) -> io::Result<Self> {
        inner.write_all(&vec![0u8; header_len])?;
        Ok(Self {
            inner,
            header_len,
            body_len: 0,
        })
    }

    pub fn body_len(&self) -> u64 {
        self.body_len
    }

    /// Writes the header built from the final body length and hands back the inner writer.
    pub fn finish(mut self, header: impl FnOnce(u64) -> Vec<u8>) -> io::Result<W> {
        if self.header_len > 0 {
            let header = header(self.body_len);
            if header.len() != self.header_len {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "header is {} bytes, {} were reserved",
                        header.len(),
                        self.header_len
                    ),
                ));
            }
            self.inner.seek(SeekFrom::Start(0))?;
            self.inner.write_all(&header)?;
            self.inner.seek(SeekFrom::End(0))?;
        }
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write + Seek> Write for HeaderSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.body_len += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Sample encoding of 8 kHz mono audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WavEncoding {
    /// G.711 µ-law
    MuLaw,
    /// G.711 A-law
    ALaw,
    /// 16-bit little-endian PCM
    Pcm16,
}

impl WavEncoding {
    fn format_tag(&self) -> u16 {
        match self {
            WavEncoding::Pcm16 => 1,
            WavEncoding::ALaw => 6,
            WavEncoding::MuLaw => 7,
        }
    }

    fn bits_per_sample(&self) -> u16 {
        match self {
            WavEncoding::Pcm16 => 16,
            WavEncoding::ALaw | WavEncoding::MuLaw => 8,
        }
    }
}

const SAMPLE_RATE: u32 = 8000;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct WavHeader {
    riff: [u8; 4],
    riff_size: U32<LittleEndian>,
    wave: [u8; 4],
    fmt: [u8; 4],
    fmt_size: U32<LittleEndian>,
    format_tag: U16<LittleEndian>,
    channels: U16<LittleEndian>,
    sample_rate: U32<LittleEndian>,
    byte_rate: U32<LittleEndian>,
    block_align: U16<LittleEndian>,
    bits_per_sample: U16<LittleEndian>,
    data: [u8; 4],
    data_size: U32<LittleEndian>,
}

const WAV_HEADER_LEN: usize = std::mem::size_of::<WavHeader>();

impl WavHeader {
    fn new(encoding: WavEncoding, data_len: u64) -> Self {
        let data_size = u32::try_from(data_len).unwrap_or(u32::MAX);
        let block_align = encoding.bits_per_sample() / 8;
        WavHeader {
            riff: *b"RIFF",
            riff_size: U32::new(data_size.saturating_add(WAV_HEADER_LEN as u32 - 8)),
            wave: *b"WAVE",
            fmt: *b"fmt ",
            fmt_size: U32::new(16),
            format_tag: U16::new(encoding.format_tag()),
            channels: U16::new(1),
            sample_rate: U32::new(SAMPLE_RATE),
            byte_rate: U32::new(SAMPLE_RATE * u32::from(block_align)),
            block_align: U16::new(block_align),
            bits_per_sample: U16::new(encoding.bits_per_sample()),
            data: *b"data",
            data_size: U32::new(data_size),
        }
    }
}

/// Builds a WAV file from decoded RTP audio. It is not fed by the network assemblers but shares
/// their naming, output layout and emission.
pub struct WavFileWriter {
    origin: TransferOrigin,
    filename: String,
    encoding: WavEncoding,
    scratch: PathBuf,
    sink: HeaderSink<BufWriter<File>>,
}

impl WavFileWriter {
    pub fn create(
        session: &Session,
        origin: TransferOrigin,
        filename: &str,
        encoding: WavEncoding,
    ) -> io::Result<Self> {
        std::fs::create_dir_all(session.cache_dir())?;
        let scratch = scratch_path(session, &origin);
        let file = File::create(&scratch)?;
        session.scratch_files().track(&scratch);
        let sink = HeaderSink::new(BufWriter::new(file), WAV_HEADER_LEN)?;
        Ok(Self {
            origin,
            filename: filename.to_string(),
            encoding,
            scratch,
            sink,
        })
    }

    pub fn write_samples(&mut self, samples: &[u8]) -> io::Result<()> {
        self.sink.write_all(samples)
    }

    pub fn sample_bytes(&self) -> u64 {
        self.sink.body_len()
    }

    /// Writes the header, moves the file to its place under the output root and emits it.
    pub fn finish(self, session: &Session) -> Result<Vec<ReconstructedFile>> {
        let WavFileWriter {
            origin,
            filename,
            encoding,
            scratch,
            sink,
        } = self;
        session.scratch_files().release(&scratch);
        let result = (|| -> Result<ReconstructedFile> {
            let writer = sink.finish(|len| WavHeader::new(encoding, len).as_bytes().to_vec())?;
            writer.into_inner().map_err(|e| e.into_error())?;
            let (filename, location) = sanitize_filename_and_location(
                &filename,
                "",
                Some("wav"),
                session.config().defang_executable_files,
            );
            let intended = output_path(session, &origin, AssemblyRoot::Source, &location, &filename)?;
            let destination = unique_path(&intended);
            move_file(&scratch, &destination)?;
            debug!("wrote {}", destination.display());
            Ok(ReconstructedFile::new(
                session.output_dir(),
                destination,
                origin,
                Some("wav".to_string()),
            )?)
        })();
        remove_quietly(&scratch);
        Ok(session.emit(result?))
    }
}
