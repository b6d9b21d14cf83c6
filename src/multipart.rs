// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Splitting `multipart/form-data` bodies into their parts.
use serde::Serialize;

use crate::errors::{Error, Result};
use crate::transfer::ContentEncoding;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MultipartPart {
    pub name: Option<String>,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: ContentEncoding,
    #[serde(skip)]
    pub data: Vec<u8>,
}

impl MultipartPart {
    /// Parts with a filename carry a file, the rest are plain form fields.
    pub fn is_file(&self) -> bool {
        self.filename.is_some()
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() || needle.is_empty() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Value of `key` in a `; key=value; key="value"` parameter list.
fn parameter(header_value: &str, key: &str) -> Option<String> {
    header_value.split(';').skip(1).find_map(|param| {
        let (k, v) = param.split_once('=')?;
        k.trim()
            .eq_ignore_ascii_case(key)
            .then(|| v.trim().trim_matches('"').to_string())
    })
}

fn boundary(content_type: &str, body: &[u8]) -> Result<String> {
    if let Some(b) = parameter(content_type, "boundary").filter(|b| !b.is_empty()) {
        return Ok(b);
    }
    // fall back to the first delimiter line of the body
    let line_end = find(body, b"\r\n", 0).unwrap_or(body.len());
    body[..line_end]
        .strip_prefix(b"--")
        .filter(|b| !b.is_empty())
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .ok_or_else(|| Error::Decode("multipart body has no boundary".to_string()))
}

fn parse_headers(raw: &[u8]) -> MultipartPart {
    let mut part = MultipartPart {
        name: None,
        filename: None,
        content_type: None,
        content_encoding: ContentEncoding::Identity,
        data: Vec::new(),
    };
    for line in String::from_utf8_lossy(raw).split("\r\n") {
        let Some((header, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match header.trim().to_ascii_lowercase().as_str() {
            "content-disposition" => {
                part.name = parameter(value, "name");
                part.filename = parameter(value, "filename");
            }
            "content-type" => part.content_type = Some(value.to_string()),
            "content-transfer-encoding" => {
                part.content_encoding = ContentEncoding::from_header(value)
            }
            _ => {}
        }
    }
    part
}

/// Splits a `multipart/form-data` body on the boundary named in `content_type`. When the content
/// type has no boundary, the first delimiter line of the body is used instead.
pub fn parse_multipart_form_data(body: &[u8], content_type: &str) -> Result<Vec<MultipartPart>> {
    let boundary = boundary(content_type, body)?;
    let delimiter = format!("--{boundary}").into_bytes();
    let next_delimiter = format!("\r\n--{boundary}").into_bytes();

    let mut cursor = find(body, &delimiter, 0)
        .ok_or_else(|| Error::Decode(format!("multipart delimiter {boundary:?} not found")))?
        + delimiter.len();
    let mut parts = Vec::new();
    loop {
        if body[cursor..].starts_with(b"--") {
            break;
        }
        let headers_start = if body[cursor..].starts_with(b"\r\n") {
            cursor + 2
        } else {
            cursor
        };
        let (headers_end, data_start) = match find(body, b"\r\n\r\n", headers_start) {
            Some(end) => (end, end + 4),
            None => {
                return Err(Error::Decode("multipart part headers are unterminated".to_string()))
            }
        };
        let Some(data_end) = find(body, &next_delimiter, data_start) else {
            return Err(Error::Decode("multipart body is missing its closing delimiter".to_string()));
        };
        let mut part = parse_headers(&body[headers_start..headers_end]);
        part.data = body[data_start..data_end].to_vec();
        parts.push(part);
        cursor = data_end + next_delimiter.len();
        if cursor >= body.len() {
            break;
        }
    }
    Ok(parts)
}
