// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! File type sniffing from the leading bytes of a transfer.
use zerocopy::{byteorder::*, *};
use zerocopy_derive::*;

pub const ICO_MAGIC: &[u8] = &[0x00, 0x00, 0x01, 0x00];

const IMAGE_FILE_DLL: u16 = 0x2000;

struct Signature {
    magic: &'static [u8],
    offset: usize,
    extension: &'static str,
}

const fn sig(magic: &'static [u8], offset: usize, extension: &'static str) -> Signature {
    Signature {
        magic,
        offset,
        extension,
    }
}

static SIGNATURES: &[Signature] = &[
    sig(b"GIF87a", 0, "gif"),
    sig(b"GIF89a", 0, "gif"),
    sig(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A], 0, "png"),
    sig(&[0xFF, 0xD8, 0xFF], 0, "jpg"),
    sig(b"%PDF-", 0, "pdf"),
    sig(&[b'P', b'K', 0x03, 0x04], 0, "zip"),
    sig(&[0x1F, 0x8B, 0x08], 0, "gz"),
    sig(b"MZ", 0, "exe"),
    sig(ICO_MAGIC, 0, "ico"),
    sig(b"BM", 0, "bmp"),
    sig(&[b'R', b'a', b'r', b'!', 0x1A, 0x07], 0, "rar"),
    sig(&[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C], 0, "7z"),
    sig(&[0xCA, 0xFE, 0xBA, 0xBE], 0, "class"),
    sig(&[0x7F, b'E', b'L', b'F'], 0, "elf"),
    sig(b"OggS", 0, "ogg"),
    sig(b"WAVE", 8, "wav"),
    sig(b"AVI ", 8, "avi"),
    sig(b"WEBP", 8, "webp"),
    sig(b"ftyp", 4, "mp4"),
    sig(b"FWS", 0, "swf"),
    sig(b"CWS", 0, "swf"),
    sig(b"ZWS", 0, "swf"),
    sig(&[b'I', b'I', 0x2A, 0x00], 0, "tif"),
    sig(&[b'M', b'M', 0x00, 0x2A], 0, "tif"),
    sig(b"{\\rtf", 0, "rtf"),
    sig(b"<?xml", 0, "xml"),
    sig(&[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1], 0, "doc"),
];

/// MS-DOS stub header, only the fields needed to find the PE header.
#[derive(FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct DosHeader {
    e_magic: [u8; 2],
    _unused: [u8; 58],
    e_lfanew: U32<LittleEndian>,
}

/// PE signature followed by the COFF file header.
#[allow(dead_code)]
#[derive(FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct PeHeader {
    signature: [u8; 4],
    machine: U16<LittleEndian>,
    number_of_sections: U16<LittleEndian>,
    time_date_stamp: U32<LittleEndian>,
    pointer_to_symbol_table: U32<LittleEndian>,
    number_of_symbols: U32<LittleEndian>,
    size_of_optional_header: U16<LittleEndian>,
    characteristics: U16<LittleEndian>,
}

fn sniff_with(table: &[Signature], header: &[u8]) -> Option<&'static str> {
    let mut best: Option<&Signature> = None;
    for candidate in table {
        let end = candidate.offset + candidate.magic.len();
        if header.len() < end || &header[candidate.offset..end] != candidate.magic {
            continue;
        }
        if best.is_none_or(|b| candidate.magic.len() > b.magic.len()) {
            best = Some(candidate);
        }
    }
    best.map(|s| s.extension)
}

/// True when `header` holds a PE image whose COFF characteristics mark it as a DLL.
fn is_dll(header: &[u8]) -> bool {
    let Ok((dos, _)) = DosHeader::read_from_prefix(header) else {
        return false;
    };
    if &dos.e_magic != b"MZ" {
        return false;
    }
    let offset = dos.e_lfanew.get() as usize;
    let Some(rest) = header.get(offset..) else {
        return false;
    };
    match PeHeader::read_from_prefix(rest) {
        Ok((pe, _)) => {
            &pe.signature == b"PE\0\0" && pe.characteristics.get() & IMAGE_FILE_DLL != 0
        }
        Err(_) => false,
    }
}

/// Sniffs a file extension from the first bytes of a file. The longest matching signature wins.
pub fn sniff_extension(header: &[u8]) -> Option<&'static str> {
    match sniff_with(SIGNATURES, header) {
        Some("exe") if is_dll(header) => Some("dll"),
        other => other,
    }
}
