// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Streaming readers that undo transfer and content encodings.
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::bufread::{DeflateDecoder, GzDecoder, ZlibDecoder};
use std::io::{self, BufRead, Read};

use crate::transfer::ContentEncoding;

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Done,
}

/// Reads the payload of an HTTP chunked transfer coding.
pub struct ChunkedReader<R> {
    inner: R,
    state: ChunkState,
}

impl<R: BufRead> ChunkedReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            state: ChunkState::Size,
        }
    }

    fn read_line(&mut self) -> io::Result<String> {
        let mut line = Vec::new();
        let n = self.inner.read_until(b'\n', &mut line)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "chunked stream ended before the last chunk",
            ));
        }
        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }
        String::from_utf8(line).map_err(|_| invalid("chunk size line is not text"))
    }

    fn read_size(&mut self) -> io::Result<u64> {
        let line = self.read_line()?;
        let size = line.split(';').next().unwrap_or("").trim();
        u64::from_str_radix(size, 16).map_err(|_| invalid(format!("bad chunk size {size:?}")))
    }

    fn skip_trailers(&mut self) -> io::Result<()> {
        loop {
            let mut line = Vec::new();
            if self.inner.read_until(b'\n', &mut line)? == 0 {
                return Ok(());
            }
            if line == b"\r\n" || line == b"\n" {
                return Ok(());
            }
        }
    }
}

impl<R: BufRead> Read for ChunkedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.state {
                ChunkState::Done => return Ok(0),
                ChunkState::Size => {
                    let size = self.read_size()?;
                    if size == 0 {
                        self.skip_trailers()?;
                        self.state = ChunkState::Done;
                    } else {
                        self.state = ChunkState::Data(size);
                    }
                }
                ChunkState::Data(remaining) => {
                    let want = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
                    let n = self.inner.read(&mut buf[..want])?;
                    if n == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "chunk data truncated",
                        ));
                    }
                    let remaining = remaining - n as u64;
                    self.state = if remaining == 0 {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(remaining)
                    };
                    return Ok(n);
                }
                ChunkState::DataEnd => {
                    let line = self.read_line()?;
                    if !line.is_empty() {
                        return Err(invalid("chunk data is not followed by CRLF"));
                    }
                    self.state = ChunkState::Size;
                }
            }
        }
    }
}

/// Two bytes that form a valid zlib stream header (RFC 1950).
fn is_zlib_header(head: &[u8]) -> bool {
    match head {
        [cmf, flg, ..] => cmf & 0x0F == 8 && (u16::from(*cmf) << 8 | u16::from(*flg)) % 31 == 0,
        _ => false,
    }
}

/// Wraps `reader` in the decoder for `encoding`. Identity and base64 are passed through; base64
/// is handled by [`Base64Decoder`].
pub fn decompressor<'a, R: BufRead + 'a>(
    encoding: ContentEncoding,
    mut reader: R,
) -> io::Result<Box<dyn Read + 'a>> {
    Ok(match encoding {
        ContentEncoding::Gzip => Box::new(GzDecoder::new(reader)),
        ContentEncoding::Deflate => {
            if is_zlib_header(reader.fill_buf()?) {
                Box::new(ZlibDecoder::new(reader))
            } else {
                Box::new(DeflateDecoder::new(reader))
            }
        }
        ContentEncoding::Identity | ContentEncoding::Base64 => Box::new(reader),
    })
}

/// Decodes base64 text as it is read, ignoring line breaks and other whitespace.
pub struct Base64Decoder<R> {
    inner: R,
    pending: Vec<u8>,
    decoded: Vec<u8>,
    position: usize,
    eof: bool,
}

impl<R: Read> Base64Decoder<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            pending: Vec::new(),
            decoded: Vec::new(),
            position: 0,
            eof: false,
        }
    }

    fn refill(&mut self) -> io::Result<()> {
        let mut raw = [0u8; 4096];
        while self.position >= self.decoded.len() && !self.eof {
            let n = self.inner.read(&mut raw)?;
            if n == 0 {
                self.eof = true;
            } else {
                self.pending
                    .extend(raw[..n].iter().copied().filter(|b| !b.is_ascii_whitespace()));
            }
            let usable = if self.eof {
                self.pending.len()
            } else {
                self.pending.len() - self.pending.len() % 4
            };
            if usable == 0 {
                continue;
            }
            let group: Vec<u8> = self.pending.drain(..usable).collect();
            self.decoded = STANDARD
                .decode(&group)
                .map_err(|e| invalid(format!("base64: {e}")))?;
            self.position = 0;
        }
        Ok(())
    }
}

impl<R: Read> Read for Base64Decoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.position >= self.decoded.len() {
            self.refill()?;
        }
        let available = &self.decoded[self.position.min(self.decoded.len())..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.position += n;
        Ok(n)
    }
}
