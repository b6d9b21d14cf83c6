// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! The closed set of transfer types handed to the engine by dissectors, and the per-type
//! semantics that decide how an assembler orders data and detects completion.
use serde::{Deserialize, Serialize};
use std::fmt;

/// How fragments of a transfer identify their position in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ordering {
    /// Fragments carry a monotonic sequence ordinal (TCP-sequence-like).
    Stream,
    /// Fragments carry an absolute file offset.
    SegmentOffset,
}

/// Static semantics of a transfer type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferTraits {
    /// Directory under the output root that files of this type are written to.
    pub protocol_dir: &'static str,
    pub ordering: Ordering,
    /// Every write announces its own length instead of relying on a declared total.
    pub segment_length_every_write: bool,
    /// Completion is signalled by the protocol rather than by reaching the content length.
    pub owns_completion: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferType {
    HttpGetNormal,
    HttpGetChunked,
    HttpPostMimeMultipartFormData,
    HttpPostMimeFileData,
    Ftp,
    Tftp,
    Tls,
    Smb,
    Smb2,
    Imap,
    Pop3,
    Smtp,
    Rtp,
    Vnc,
    Iec104,
    Meterpreter,
    NjRat,
}

const fn stream(protocol_dir: &'static str) -> TransferTraits {
    TransferTraits {
        protocol_dir,
        ordering: Ordering::Stream,
        segment_length_every_write: false,
        owns_completion: false,
    }
}

impl TransferType {
    pub const ALL: [TransferType; 17] = [
        TransferType::HttpGetNormal,
        TransferType::HttpGetChunked,
        TransferType::HttpPostMimeMultipartFormData,
        TransferType::HttpPostMimeFileData,
        TransferType::Ftp,
        TransferType::Tftp,
        TransferType::Tls,
        TransferType::Smb,
        TransferType::Smb2,
        TransferType::Imap,
        TransferType::Pop3,
        TransferType::Smtp,
        TransferType::Rtp,
        TransferType::Vnc,
        TransferType::Iec104,
        TransferType::Meterpreter,
        TransferType::NjRat,
    ];

    pub const fn traits(&self) -> TransferTraits {
        match self {
            TransferType::HttpGetNormal
            | TransferType::HttpPostMimeMultipartFormData
            | TransferType::HttpPostMimeFileData => stream("HTTP"),
            TransferType::HttpGetChunked => TransferTraits {
                segment_length_every_write: true,
                owns_completion: true,
                ..stream("HTTP")
            },
            TransferType::Ftp => stream("FTP"),
            TransferType::Tftp => TransferTraits {
                segment_length_every_write: true,
                owns_completion: true,
                ..stream("TFTP")
            },
            TransferType::Tls => stream("TLS_Cert"),
            TransferType::Smb => TransferTraits {
                owns_completion: true,
                ..stream("SMB")
            },
            TransferType::Smb2 => TransferTraits {
                protocol_dir: "SMB2",
                ordering: Ordering::SegmentOffset,
                segment_length_every_write: true,
                owns_completion: true,
            },
            TransferType::Imap => stream("IMAP"),
            TransferType::Pop3 => stream("POP3"),
            TransferType::Smtp => stream("SMTP"),
            TransferType::Rtp => TransferTraits {
                owns_completion: true,
                ..stream("RTP")
            },
            TransferType::Vnc => stream("VNC"),
            TransferType::Iec104 => stream("IEC-104"),
            TransferType::Meterpreter => stream("Meterpreter"),
            TransferType::NjRat => stream("njRAT"),
        }
    }

    pub const fn protocol_dir(&self) -> &'static str {
        self.traits().protocol_dir
    }

    pub fn is_chunked(&self) -> bool {
        matches!(self, TransferType::HttpGetChunked)
    }
}

impl fmt::Display for TransferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Which endpoint of the flow names the directory a file is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssemblyRoot {
    /// Flat staging directory under the output root.
    Cache,
    /// The endpoint that sent the file.
    #[default]
    Source,
    /// The endpoint that received the file.
    Destination,
}

/// Content or transfer encoding that must be undone before a file is real.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentEncoding {
    #[default]
    Identity,
    Gzip,
    Deflate,
    Base64,
}

impl ContentEncoding {
    /// Parses a `Content-Encoding` or `Content-Transfer-Encoding` header value.
    pub fn from_header(value: &str) -> Self {
        let value = value.trim().to_ascii_lowercase();
        match value.as_str() {
            "gzip" | "x-gzip" => ContentEncoding::Gzip,
            "deflate" => ContentEncoding::Deflate,
            "base64" => ContentEncoding::Base64,
            _ => ContentEncoding::Identity,
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, ContentEncoding::Gzip | ContentEncoding::Deflate)
    }
}
