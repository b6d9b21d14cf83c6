// SPDX-License-Identifier: BSD-3-Clause-LBNL
use crate::errors::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Inclusive byte interval of a file plus its total size, when known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: Option<u64>,
}

impl ContentRange {
    pub fn new(start: u64, end: u64, total: Option<u64>) -> Result<Self> {
        if start > end {
            return Err(Error::InvalidRange(format!(
                "start {start} is past end {end}"
            )));
        }
        if let Some(total) = total {
            if end >= total {
                return Err(Error::InvalidRange(format!(
                    "end {end} is not below total {total}"
                )));
            }
        }
        Ok(Self { start, end, total })
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// True when the range spans the whole file.
    pub fn is_complete_file(&self) -> bool {
        self.start == 0 && self.total == Some(self.end + 1)
    }
}

impl FromStr for ContentRange {
    type Err = Error;

    /// Parses the value of a `Content-Range` header, e.g. `bytes 0-149/200` or `bytes 0-149/*`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let spec = s
            .strip_prefix("bytes")
            .map(|rest| rest.trim_start_matches([' ', '=']))
            .unwrap_or(s);
        let (range, total) = spec
            .split_once('/')
            .ok_or_else(|| Error::InvalidRange(s.to_string()))?;
        let (start, end) = range
            .split_once('-')
            .ok_or_else(|| Error::InvalidRange(s.to_string()))?;
        let parse = |v: &str| {
            v.trim()
                .parse::<u64>()
                .map_err(|_| Error::InvalidRange(s.to_string()))
        };
        let total = match total.trim() {
            "*" => None,
            t => Some(parse(t)?),
        };
        ContentRange::new(parse(start)?, parse(end)?, total)
    }
}

impl fmt::Display for ContentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.total {
            Some(total) => write!(f, "bytes {}-{}/{}", self.start, self.end, total),
            None => write!(f, "bytes {}-{}/*", self.start, self.end),
        }
    }
}
