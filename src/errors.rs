// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Common `Error` and `Result` types used throughout the library and application. Serves as a reference for all that can go wrong.
use crate::config::ConfigError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] ConfigError),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("file segment error: {0}")]
    Segment(#[from] crate::assembler::segment::SegmentError),

    #[error("partial file assembler {0} is already closed")]
    PartialAssemblerClosed(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("path too long: {0}")]
    PathTooLong(PathBuf),

    #[error("invalid content range: {0}")]
    InvalidRange(String),

    #[error("malformed URL: {0}")]
    URLParseError(#[from] url::ParseError),

    #[error("usage error: {0}")]
    Usage(String),

    #[error("{0} not found")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, Error>;
