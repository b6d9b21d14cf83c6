// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! The bounded set of live assemblers, keyed by transfer.
//!
//! Only one assembler per [`TransferKey`] is active at a time. Assemblers started while another
//! one holds the key wait in a per-key queue and are promoted once the slot is free.
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    remove_quietly, FileSegmentAssembler, FileStreamAssembler, FinalizeContext,
    PartialFileAssembler, Progress, SegmentError, SegmentProgress,
};
use crate::bounded_map::BoundedMap;
use crate::constants::CACHE_DIR_NAME;
use crate::errors::Result;
use crate::flow::TransferKey;
use crate::metrics::ASSEMBLERS_EVICTED;
use crate::reconstructed_file::ReconstructedFile;
use crate::session::Session;

/// Registry handle for hosts that dissect flows on several threads.
pub type SharedRegistry = Arc<Mutex<AssemblerRegistry>>;

pub enum Assembler {
    Stream(FileStreamAssembler),
    Segment(FileSegmentAssembler),
}

impl From<FileStreamAssembler> for Assembler {
    fn from(assembler: FileStreamAssembler) -> Self {
        Assembler::Stream(assembler)
    }
}

impl From<FileSegmentAssembler> for Assembler {
    fn from(assembler: FileSegmentAssembler) -> Self {
        Assembler::Segment(assembler)
    }
}

impl Assembler {
    pub fn key(&self) -> &TransferKey {
        match self {
            Assembler::Stream(a) => a.key(),
            Assembler::Segment(a) => a.key(),
        }
    }

    pub fn scratch_path(&self) -> &Path {
        match self {
            Assembler::Stream(a) => a.scratch_path(),
            Assembler::Segment(a) => a.scratch_path(),
        }
    }

    /// Segment assemblers open their scratch file on first write.
    fn try_activate(&mut self, session: &Session) -> io::Result<()> {
        match self {
            Assembler::Stream(a) => a.try_activate(session),
            Assembler::Segment(_) => Ok(()),
        }
    }

    fn clear(&mut self, session: &Session) {
        match self {
            Assembler::Stream(a) => a.clear(session),
            Assembler::Segment(a) => a.clear(session),
        }
    }

    fn finish(&mut self, ctx: &mut FinalizeContext<'_>) -> Vec<ReconstructedFile> {
        match self {
            Assembler::Stream(a) => a.finish(ctx),
            Assembler::Segment(a) => a.assemble_and_close(ctx),
        }
    }
}

pub struct AssemblerRegistry {
    session: Arc<Session>,
    active: BoundedMap<TransferKey, Assembler>,
    queued: BoundedMap<TransferKey, VecDeque<Assembler>>,
    partials: BoundedMap<String, PartialFileAssembler>,
}

impl AssemblerRegistry {
    pub fn new(session: Arc<Session>) -> Self {
        let capacity = session.config().registry_capacity;
        let mut active = BoundedMap::new(capacity);
        let mut queued = BoundedMap::new(capacity);
        let mut partials = BoundedMap::new(capacity);

        let hook_session = session.clone();
        active.set_eviction_hook(Box::new(move |key: TransferKey, mut assembler: Assembler| {
            ASSEMBLERS_EVICTED.inc();
            assembler.clear(&hook_session);
            hook_session.report_anomaly(&format!("evicted unfinished transfer {key}"));
        }));
        let hook_session = session.clone();
        queued.set_eviction_hook(Box::new(
            move |key: TransferKey, pending: VecDeque<Assembler>| {
                ASSEMBLERS_EVICTED.inc_by(pending.len() as f64);
                for mut assembler in pending {
                    assembler.clear(&hook_session);
                }
                hook_session.report_anomaly(&format!("evicted queued transfers of {key}"));
            },
        ));
        let extract_partial = session.config().extract_partial_downloads;
        partials.set_eviction_hook(Box::new(move |key: String, partial: PartialFileAssembler| {
            debug!("evicted partial file {key}");
            partial.discard(extract_partial);
        }));

        Self {
            session,
            active,
            queued,
            partials,
        }
    }

    pub fn shared(self) -> SharedRegistry {
        Arc::new(Mutex::new(self))
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn contains(&self, key: &TransferKey) -> bool {
        self.active.contains_key(key)
    }

    pub fn queued_len(&self, key: &TransferKey) -> usize {
        self.queued.peek(key).map_or(0, VecDeque::len)
    }

    pub fn partial_count(&self) -> usize {
        self.partials.len()
    }

    /// Activates and stores `assembler`, or queues it behind the live assembler of the same
    /// transfer. Returns true when it became the live one.
    pub fn add_or_enqueue(&mut self, assembler: impl Into<Assembler>) -> bool {
        let mut assembler = assembler.into();
        let key = assembler.key().clone();
        self.promote(&key);
        if self.active.contains_key(&key) {
            debug!("queueing transfer behind live assembler for {key}");
            match self.queued.get_mut(&key) {
                Some(pending) => pending.push_back(assembler),
                None => {
                    self.queued.insert(key, VecDeque::from([assembler]));
                }
            }
            return false;
        }
        if let Err(e) = assembler.try_activate(&self.session) {
            self.session
                .report_io_error(assembler.scratch_path(), "error creating", &e);
            return false;
        }
        self.active.insert(key, assembler);
        true
    }

    /// Moves the first queued assembler of `key` into the free slot.
    fn promote(&mut self, key: &TransferKey) {
        if self.active.contains_key(key) {
            return;
        }
        loop {
            let next = match self.queued.get_mut(key) {
                Some(pending) => pending.pop_front(),
                None => return,
            };
            if self.queued.peek(key).is_some_and(VecDeque::is_empty) {
                self.queued.remove(key);
            }
            let Some(mut next) = next else {
                return;
            };
            match next.try_activate(&self.session) {
                Ok(()) => {
                    debug!("promoted queued transfer for {key}");
                    self.active.insert(key.clone(), next);
                    return;
                }
                Err(e) => self
                    .session
                    .report_io_error(next.scratch_path(), "error creating", &e),
            }
        }
    }

    pub fn stream_mut(&mut self, key: &TransferKey) -> Option<&mut FileStreamAssembler> {
        self.promote(key);
        match self.active.get_mut(key) {
            Some(Assembler::Stream(a)) => Some(a),
            _ => None,
        }
    }

    pub fn segment_mut(&mut self, key: &TransferKey) -> Option<&mut FileSegmentAssembler> {
        self.promote(key);
        match self.active.get_mut(key) {
            Some(Assembler::Segment(a)) => Some(a),
            _ => None,
        }
    }

    /// Hands a sequence-tagged fragment to the live stream assembler of `key` and finishes it
    /// when that was the last byte.
    pub fn add_data(
        &mut self,
        key: &TransferKey,
        data: &[u8],
        sequence: u64,
    ) -> Vec<ReconstructedFile> {
        let session = self.session.clone();
        let Some(assembler) = self.stream_mut(key) else {
            debug!("no stream assembler for {key}, dropping {} bytes", data.len());
            return Vec::new();
        };
        match assembler.add_data(&session, data, sequence) {
            Progress::Complete => self.finish(key),
            _ => Vec::new(),
        }
    }

    /// Hands an offset-tagged fragment to the live segment assembler of `key`. A fragment past
    /// the declared size discards the assembler and is returned as an error.
    pub fn add_segment_data(
        &mut self,
        key: &TransferKey,
        offset: u64,
        data: &[u8],
        frame_number: u64,
    ) -> Result<Vec<ReconstructedFile>> {
        let session = self.session.clone();
        let Some(assembler) = self.segment_mut(key) else {
            debug!("no segment assembler for {key}, dropping {} bytes", data.len());
            return Ok(Vec::new());
        };
        match assembler.add_data(&session, offset, data, frame_number) {
            Ok(SegmentProgress::Complete) => Ok(self.finish(key)),
            Ok(SegmentProgress::Incomplete { .. }) => Ok(Vec::new()),
            Err(e) => {
                warn!("discarding segment assembler for {key}: {e}");
                if let SegmentError::Io(io_error) = &e {
                    session.report_io_error(assembler.scratch_path(), "error writing", io_error);
                } else {
                    session.report_anomaly(&format!("{key}: {e}"));
                }
                self.remove(key, true);
                Err(e.into())
            }
        }
    }

    /// Finishes the live assembler of `key`. Its slot is handed to the next queued assembler
    /// before the file is written.
    pub fn finish(&mut self, key: &TransferKey) -> Vec<ReconstructedFile> {
        let Some(mut assembler) = self.active.remove(key) else {
            return Vec::new();
        };
        self.promote(key);
        let mut ctx = FinalizeContext {
            session: &self.session,
            partials: &mut self.partials,
        };
        assembler.finish(&mut ctx)
    }

    /// Removes the live assembler of `key`, promoting the next queued one. With `should_clear`
    /// its buffered data and scratch file are dropped.
    pub fn remove(&mut self, key: &TransferKey, should_clear: bool) -> Option<Assembler> {
        let mut assembler = self.active.remove(key)?;
        if should_clear {
            assembler.clear(&self.session);
        }
        self.promote(key);
        Some(assembler)
    }

    /// Session reset: drops every assembler, queue and partial file and every scratch file. With
    /// `remove_from_disk` the output directory is wiped too, except that the cache directory is
    /// only emptied.
    pub fn clear(&mut self, remove_from_disk: bool) {
        self.session.scratch_files().dispose_all();
        for (_, mut assembler) in self.active.drain() {
            assembler.clear(&self.session);
        }
        for (_, pending) in self.queued.drain() {
            for mut assembler in pending {
                assembler.clear(&self.session);
            }
        }
        let extract_partial = self.session.config().extract_partial_downloads;
        for (key, partial) in self.partials.drain() {
            debug!("discarding partial file {key}");
            partial.discard(extract_partial);
        }
        if remove_from_disk {
            let output = self.session.output_dir().to_path_buf();
            if let Err(e) = empty_output_directory(&output) {
                self.session
                    .report_io_error(&output, "error clearing", &e);
            }
        }
        info!("cleared assembler registry");
    }
}

fn empty_directory(directory: &Path) -> io::Result<()> {
    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

fn empty_output_directory(output: &Path) -> io::Result<()> {
    if !output.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(output)? {
        let path = entry?.path();
        if path.file_name().is_some_and(|n| n == CACHE_DIR_NAME) && path.is_dir() {
            empty_directory(&path)?;
        } else if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            remove_quietly(&path);
        }
    }
    Ok(())
}
