// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! The capture-session context shared by the registry and every assembler: configuration,
//! output root, collaborator callbacks, carvers, and the scratch files still on disk.
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::carve::{carve_file, FileCarver};
use crate::config::ReconstructionConfig;
use crate::constants::CACHE_DIR_NAME;
use crate::flow::{Direction, Flow};
use crate::metrics::{ANOMALIES, FILES_RECONSTRUCTED};
use crate::multipart::MultipartPart;
use crate::reconstructed_file::ReconstructedFile;
use crate::transfer::TransferType;

/// Callbacks into the application that owns analysis and display.
pub trait ReconstructionEvents: Send + Sync {
    /// Non-fatal error or warning surfaced for operator visibility.
    fn on_anomaly(&self, message: &str);

    /// A write failed for lack of permissions; later writes will most likely fail too.
    fn on_insufficient_write_permissions(&self, path: &Path);

    fn on_reconstructed_file(&self, file: &ReconstructedFile);

    fn extract_multipart_form_data(
        &self,
        _parts: &[MultipartPart],
        _flow: &Flow,
        _direction: Direction,
        _timestamp: DateTime<Utc>,
        _frame_number: u64,
        _transfer_type: TransferType,
    ) {
    }
}

/// Routes every callback to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingEvents;

impl ReconstructionEvents for LoggingEvents {
    fn on_anomaly(&self, message: &str) {
        warn!("{message}");
    }

    fn on_insufficient_write_permissions(&self, path: &Path) {
        warn!("insufficient write permissions for {}", path.display());
    }

    fn on_reconstructed_file(&self, file: &ReconstructedFile) {
        info!(
            "reconstructed {} ({} bytes) from {}",
            file.path().display(),
            file.size(),
            file.flow().directional(file.origin().direction)
        );
    }

    fn extract_multipart_form_data(
        &self,
        parts: &[MultipartPart],
        flow: &Flow,
        direction: Direction,
        _timestamp: DateTime<Utc>,
        frame_number: u64,
        _transfer_type: TransferType,
    ) {
        for part in parts.iter().filter(|p| p.filename.is_none()) {
            debug!(
                "form field {}={} in frame {frame_number} of {}",
                part.name.as_deref().unwrap_or(""),
                String::from_utf8_lossy(&part.data),
                flow.directional(direction)
            );
        }
    }
}

/// Scratch files currently open by some assembler in this session.
#[derive(Debug, Default)]
pub struct ScratchFiles {
    paths: Mutex<HashSet<PathBuf>>,
}

impl ScratchFiles {
    pub fn track(&self, path: &Path) {
        self.paths.lock().insert(path.to_path_buf());
    }

    pub fn release(&self, path: &Path) {
        self.paths.lock().remove(path);
    }

    pub fn len(&self) -> usize {
        self.paths.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.lock().is_empty()
    }

    /// Deletes every tracked scratch file, whichever assembler created it.
    pub fn dispose_all(&self) {
        let paths: Vec<PathBuf> = self.paths.lock().drain().collect();
        for path in paths {
            match fs::remove_file(&path) {
                Ok(()) => debug!("disposed scratch file {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("could not dispose {}: {e}", path.display()),
            }
        }
    }
}

pub struct Session {
    config: ReconstructionConfig,
    events: Arc<dyn ReconstructionEvents>,
    carvers: HashMap<TransferType, Box<dyn FileCarver>>,
    scratch: ScratchFiles,
}

impl Session {
    pub fn new(config: ReconstructionConfig, events: Arc<dyn ReconstructionEvents>) -> Self {
        Self {
            config,
            events,
            carvers: HashMap::new(),
            scratch: ScratchFiles::default(),
        }
    }

    pub fn with_carver(mut self, transfer_type: TransferType, carver: Box<dyn FileCarver>) -> Self {
        self.carvers.insert(transfer_type, carver);
        self
    }

    pub fn config(&self) -> &ReconstructionConfig {
        &self.config
    }

    pub fn output_dir(&self) -> &Path {
        &self.config.output_directory
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.config.output_directory.join(CACHE_DIR_NAME)
    }

    pub fn scratch_files(&self) -> &ScratchFiles {
        &self.scratch
    }

    pub fn events(&self) -> &dyn ReconstructionEvents {
        self.events.as_ref()
    }

    pub fn report_anomaly(&self, message: &str) {
        ANOMALIES.inc();
        self.events.on_anomaly(message);
    }

    /// Permission failures get their own callback, every other I/O error is an anomaly.
    pub fn report_io_error(&self, path: &Path, context: &str, error: &io::Error) {
        if error.kind() == io::ErrorKind::PermissionDenied {
            ANOMALIES.inc();
            self.events.on_insufficient_write_permissions(path);
        } else {
            self.report_anomaly(&format!("{context} {}: {error}", path.display()));
        }
    }

    /// Hands a finished file to the application and carves it when a carver is registered
    /// for its protocol. Returns the file followed by anything carved out of it.
    pub fn emit(&self, file: ReconstructedFile) -> Vec<ReconstructedFile> {
        FILES_RECONSTRUCTED
            .with_label_values(&[file.transfer_type().protocol_dir()])
            .inc();
        self.events.on_reconstructed_file(&file);
        let carved = match self.carvers.get(&file.transfer_type()) {
            Some(carver) => carve_file(self, &file, carver.as_ref()),
            None => Vec::new(),
        };
        let mut emitted = Vec::with_capacity(carved.len() + 1);
        emitted.push(file);
        emitted.extend(carved);
        emitted
    }
}
