// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Drives a registry from a JSON-lines manifest of transfer events, the way a dissector would.
//!
//! ```text
//! {"event":"start","transfer":"t1","transport":"tcp","client":"10.0.0.1:50000","server":"10.0.0.2:80","direction":"server_to_client","type":"HttpGetNormal","filename":"a.gif","content_length":6}
//! {"event":"data","transfer":"t1","sequence":0,"payload":"R0lGODlh"}
//! {"event":"finish","transfer":"t1"}
//! ```
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::assembler::{AssemblerRegistry, FileSegmentAssembler, FileStreamAssemblerBuilder};
use crate::config::ReconstructionConfig;
use crate::content_range::ContentRange;
use crate::errors::{Error, Result};
use crate::flow::{Direction, Flow, TransferKey, Transport};
use crate::multipart::MultipartPart;
use crate::reconstructed_file::ReconstructedFile;
use crate::session::{LoggingEvents, ReconstructionEvents, Session};
use crate::transfer::{AssemblyRoot, ContentEncoding, Ordering, TransferType};

#[derive(Debug, Deserialize)]
pub struct StartEvent {
    pub transfer: String,
    pub transport: Transport,
    pub client: SocketAddr,
    pub server: SocketAddr,
    pub direction: Direction,
    #[serde(rename = "type")]
    pub transfer_type: TransferType,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub location: String,
    pub content_length: Option<u64>,
    pub content_range: Option<String>,
    #[serde(default)]
    pub details: String,
    pub extended_file_id: Option<String>,
    #[serde(default)]
    pub frame: u64,
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub root: AssemblyRoot,
    #[serde(default)]
    pub content_encoding: ContentEncoding,
    pub content_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ManifestEvent {
    Start(StartEvent),
    Data {
        transfer: String,
        sequence: u64,
        payload: String,
    },
    Segment {
        transfer: String,
        offset: u64,
        payload: String,
        #[serde(default)]
        frame: u64,
    },
    Remaining {
        transfer: String,
        bytes: u64,
    },
    Finish {
        transfer: String,
    },
}

/// A report generated after replaying a manifest.
#[derive(Debug, Serialize)]
pub struct ReplayReport {
    /// Every file emitted, including merged ranges and carved files.
    pub files: Vec<ReconstructedFile>,
    /// Anomalies reported by the engine.
    pub anomalies: Vec<String>,
    /// Manifest lines that could not be applied, with their line number.
    pub errors: Vec<String>,
    /// Transfers still open when the manifest ended.
    pub unfinished: Vec<String>,
    pub events: usize,
}

impl fmt::Display for ReplayReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "# Replay Report")?;
        writeln!(f, "{} events", self.events)?;
        writeln!(f, "{} reconstructed files", self.files.len())?;
        writeln!(f, "{} anomalies", self.anomalies.len())?;
        writeln!(f, "{} errors", self.errors.len())?;
        writeln!(f, "{} unfinished transfers", self.unfinished.len())?;

        writeln!(f, "\n## Reconstructed Files")?;
        for file in &self.files {
            let hash = file.hash().unwrap_or("-");
            writeln!(
                f,
                "{} {} bytes {} sha256 {}",
                file.relative_uri().unwrap_or(&file.path().display().to_string()),
                file.size(),
                file.transfer_type(),
                hash
            )?;
        }
        if !self.anomalies.is_empty() {
            writeln!(f, "\n## Anomalies")?;
            for anomaly in &self.anomalies {
                writeln!(f, "{anomaly}")?;
            }
        }
        if !self.errors.is_empty() {
            writeln!(f, "\n## Errors")?;
            for error in &self.errors {
                writeln!(f, "{error}")?;
            }
        }
        if !self.unfinished.is_empty() {
            writeln!(f, "\n## Unfinished Transfers")?;
            for transfer in &self.unfinished {
                writeln!(f, "{transfer}")?;
            }
        }
        Ok(())
    }
}

/// Logs like [`LoggingEvents`] and keeps the anomalies for the report.
#[derive(Default)]
struct ReplayEvents {
    anomalies: Mutex<Vec<String>>,
}

impl ReconstructionEvents for ReplayEvents {
    fn on_anomaly(&self, message: &str) {
        LoggingEvents.on_anomaly(message);
        self.anomalies.lock().push(message.to_string());
    }

    fn on_insufficient_write_permissions(&self, path: &Path) {
        LoggingEvents.on_insufficient_write_permissions(path);
        self.anomalies
            .lock()
            .push(format!("insufficient write permissions for {}", path.display()));
    }

    fn on_reconstructed_file(&self, file: &ReconstructedFile) {
        LoggingEvents.on_reconstructed_file(file);
    }

    fn extract_multipart_form_data(
        &self,
        parts: &[MultipartPart],
        flow: &Flow,
        direction: Direction,
        timestamp: DateTime<Utc>,
        frame_number: u64,
        transfer_type: TransferType,
    ) {
        LoggingEvents.extract_multipart_form_data(
            parts,
            flow,
            direction,
            timestamp,
            frame_number,
            transfer_type,
        );
    }
}

struct Replayer<'a> {
    registry: &'a mut AssemblerRegistry,
    transfers: HashMap<String, TransferKey>,
    files: Vec<ReconstructedFile>,
}

impl Replayer<'_> {
    fn key(&self, transfer: &str) -> Result<TransferKey> {
        self.transfers
            .get(transfer)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("transfer {transfer:?}")))
    }

    fn start(&mut self, start: StartEvent) -> Result<()> {
        let flow = Flow::new(start.transport, start.client, start.server);
        let timestamp = start.timestamp.unwrap_or_else(Utc::now);
        let session = self.registry.session().clone();
        let key = TransferKey::new(&flow, start.direction, start.extended_file_id.as_deref());

        if start.transfer_type.traits().ordering == Ordering::SegmentOffset {
            let size = start.content_length.ok_or_else(|| {
                Error::Usage(format!(
                    "segment transfer {} needs a content_length",
                    start.transfer
                ))
            })?;
            let mut segment = FileSegmentAssembler::new(
                &session,
                flow,
                start.direction,
                start.transfer_type,
                &start.filename,
                &start.location,
                size,
                &start.details,
                start.extended_file_id.as_deref(),
                start.frame,
                timestamp,
            )
            .with_root(start.root)
            .with_content_encoding(start.content_encoding);
            if let Some(range) = start.content_range {
                segment = segment.with_content_range(range.parse::<ContentRange>()?);
            }
            self.registry.add_or_enqueue(segment);
        } else {
            let mut builder =
                FileStreamAssemblerBuilder::new(flow, start.direction, start.transfer_type)
                    .filename(start.filename)
                    .location(start.location)
                    .details(start.details)
                    .frame(start.frame, timestamp)
                    .root(start.root)
                    .content_encoding(start.content_encoding);
            if let Some(length) = start.content_length {
                builder = builder.content_length(length);
            }
            if let Some(range) = start.content_range {
                builder = builder.content_range(range.parse::<ContentRange>()?);
            }
            if let Some(id) = start.extended_file_id {
                builder = builder.extended_file_id(id);
            }
            if let Some(content_type) = start.content_type {
                builder = builder.content_type(content_type);
            }
            self.registry.add_or_enqueue(builder.build(&session));
        }
        self.transfers.insert(start.transfer, key);
        Ok(())
    }

    fn apply(&mut self, event: ManifestEvent) -> Result<()> {
        match event {
            ManifestEvent::Start(start) => self.start(start)?,
            ManifestEvent::Data {
                transfer,
                sequence,
                payload,
            } => {
                let key = self.key(&transfer)?;
                let data = STANDARD.decode(payload)?;
                self.files
                    .extend(self.registry.add_data(&key, &data, sequence));
            }
            ManifestEvent::Segment {
                transfer,
                offset,
                payload,
                frame,
            } => {
                let key = self.key(&transfer)?;
                let data = STANDARD.decode(payload)?;
                self.files
                    .extend(self.registry.add_segment_data(&key, offset, &data, frame)?);
            }
            ManifestEvent::Remaining { transfer, bytes } => {
                let key = self.key(&transfer)?;
                self.registry
                    .stream_mut(&key)
                    .ok_or_else(|| Error::NotFound(format!("stream transfer {transfer:?}")))?
                    .set_remaining_bytes(bytes);
            }
            ManifestEvent::Finish { transfer } => {
                let key = self.key(&transfer)?;
                self.files.extend(self.registry.finish(&key));
            }
        }
        Ok(())
    }
}

/// Replays every line of `manifest` against `registry`. Lines that fail are recorded in the
/// report and skipped. Transfers left open are listed and cleared.
pub fn replay<R: BufRead>(registry: &mut AssemblerRegistry, manifest: R) -> Result<ReplayReport> {
    let mut replayer = Replayer {
        registry,
        transfers: HashMap::new(),
        files: Vec::new(),
    };
    let mut errors = Vec::new();
    let mut events = 0;
    for (index, line) in manifest.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let applied = serde_json::from_str::<ManifestEvent>(&line)
            .map_err(Error::from)
            .and_then(|event| replayer.apply(event));
        match applied {
            Ok(()) => events += 1,
            Err(e) => {
                warn!("manifest line {}: {e}", index + 1);
                errors.push(format!("line {}: {e}", index + 1));
            }
        }
    }

    let Replayer {
        registry,
        transfers,
        files,
    } = replayer;
    let mut unfinished: Vec<String> = transfers
        .into_iter()
        .filter(|(_, key)| registry.contains(key))
        .map(|(name, key)| format!("{name} ({key})"))
        .collect();
    unfinished.sort();
    if !unfinished.is_empty() {
        debug!("{} transfers unfinished at end of manifest", unfinished.len());
    }
    registry.clear(false);

    Ok(ReplayReport {
        files,
        anomalies: Vec::new(),
        errors,
        unfinished,
        events,
    })
}

/// Replays a manifest file into a fresh session writing to `config.output_directory`.
pub fn replay_file(config: ReconstructionConfig, manifest: &Path) -> Result<ReplayReport> {
    let reader = BufReader::new(File::open(manifest)?);
    let events = Arc::new(ReplayEvents::default());
    let session = Arc::new(Session::new(config, events.clone()));
    let mut registry = AssemblerRegistry::new(session);
    let mut report = replay(&mut registry, reader)?;
    report.anomalies = std::mem::take(&mut *events.anomalies.lock());
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const MANIFEST: &str = r#"
{"event":"start","transfer":"gif","transport":"tcp","client":"10.0.0.1:50000","server":"10.0.0.2:80","direction":"server_to_client","type":"HttpGetNormal","filename":"logo","content_length":10,"details":"http://example.com/logo"}
{"event":"data","transfer":"gif","sequence":4,"payload":"AAAAAA=="}
{"event":"data","transfer":"gif","sequence":0,"payload":"R0lGODlh"}
{"event":"start","transfer":"smb","transport":"tcp","client":"10.0.0.1:49152","server":"10.0.0.2:445","direction":"server_to_client","type":"Smb2","filename":"doc.txt","content_length":4,"extended_file_id":"fid"}
{"event":"segment","transfer":"smb","offset":2,"payload":"Y2Q="}
{"event":"segment","transfer":"smb","offset":0,"payload":"YWI="}
{"event":"data","transfer":"missing","sequence":0,"payload":"AA=="}
not json
{"event":"start","transfer":"open","transport":"udp","client":"10.0.0.1:69","server":"10.0.0.2:69","direction":"client_to_server","type":"Tftp","filename":"boot.img"}
{"event":"data","transfer":"open","sequence":0,"payload":"AAEC"}
"#;

    #[test]
    fn test_replay_manifest() {
        let dir = tempdir().unwrap();
        let manifest = dir.path().join("manifest.jsonl");
        fs::write(&manifest, MANIFEST).unwrap();
        let output = dir.path().join("out");

        let report =
            replay_file(ReconstructionConfig::with_output_directory(&output), &manifest).unwrap();
        assert_eq!(report.files.len(), 2);
        assert_eq!(report.files[0].filename(), "logo.gif");
        assert_eq!(report.files[0].size(), 10);
        assert_eq!(fs::read(report.files[1].path()).unwrap(), b"abcd");
        assert_eq!(report.errors.len(), 2);
        assert_eq!(report.unfinished.len(), 1);
        assert!(report.unfinished[0].starts_with("open"));
        assert_eq!(report.events, 8);

        let text = report.to_string();
        assert!(text.contains("2 reconstructed files"));
        assert!(text.contains("HTTP/10.0.0.2/TCP-80/logo.gif"));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["files"][0]["transfer_type"], "HttpGetNormal");
    }
}
