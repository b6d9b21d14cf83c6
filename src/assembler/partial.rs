// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Merging independently finished byte ranges of one file.
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

use super::{move_file, remove_quietly};
use crate::content_range::ContentRange;
use crate::errors::{Error, Result};
use crate::reconstructed_file::{ReconstructedFile, TransferOrigin};
use crate::sanitize::unique_path;

pub struct PartialFileAssembler {
    key: String,
    total: u64,
    destination: PathBuf,
    origin: TransferOrigin,
    fragments: BTreeMap<u64, (ContentRange, ReconstructedFile)>,
    closed: bool,
}

impl PartialFileAssembler {
    /// `destination` is where the merged file goes, before collision resolution.
    pub fn new(key: String, total: u64, destination: PathBuf, origin: TransferOrigin) -> Self {
        Self {
            key,
            total,
            destination,
            origin,
            fragments: BTreeMap::new(),
            closed: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    /// Adds a fragment. Of two fragments starting at the same offset the larger file is kept.
    pub fn add_file(&mut self, range: ContentRange, file: ReconstructedFile) -> Result<()> {
        if self.closed {
            return Err(Error::PartialAssemblerClosed(self.key.clone()));
        }
        match self.fragments.get(&range.start) {
            Some((_, existing)) if existing.size() >= file.size() => {
                debug!(
                    "{}: keeping {} over smaller fragment at {}",
                    self.key,
                    existing.path().display(),
                    range.start
                );
            }
            _ => {
                self.fragments.insert(range.start, (range, file));
            }
        }
        Ok(())
    }

    /// True when the fragments cover `[0, total)` without a gap.
    pub fn is_complete(&self) -> bool {
        let mut next_offset = 0u64;
        for (start, (_, file)) in &self.fragments {
            if *start > next_offset {
                break;
            }
            next_offset = next_offset.max(start + file.size());
        }
        next_offset >= self.total
    }

    fn write_merged(&self, output: &Path) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(output)?);
        let mut position = 0u64;
        for (start, (_, fragment)) in &self.fragments {
            let end = start + fragment.size();
            if end <= position {
                continue;
            }
            let mut reader = File::open(fragment.path())?;
            // skip the prefix already written by earlier fragments
            let local_offset = position.saturating_sub(*start);
            reader.seek(SeekFrom::Start(local_offset))?;
            position += io::copy(&mut reader.take(end - start - local_offset), &mut writer)?;
            if position >= self.total {
                break;
            }
        }
        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.set_len(self.total.min(position))
    }

    /// Writes the merged file and closes the assembler. Unless `keep_fragments` is set, the
    /// fragment files are deleted once the merged file exists.
    pub fn reassemble(
        &mut self,
        output_root: &Path,
        keep_fragments: bool,
    ) -> Result<ReconstructedFile> {
        if self.closed {
            return Err(Error::PartialAssemblerClosed(self.key.clone()));
        }
        self.closed = true;

        let parent = self.destination.parent().unwrap_or(output_root);
        let staging = parent.join(format!(".merge-{}", Uuid::new_v4().simple()));
        if let Err(e) = self.write_merged(&staging) {
            remove_quietly(&staging);
            self.fragments.clear();
            return Err(e.into());
        }

        let fragments = std::mem::take(&mut self.fragments);
        if !keep_fragments {
            for (_, fragment) in fragments.values() {
                remove_quietly(fragment.path());
            }
        }
        let destination = unique_path(&self.destination);
        if let Err(e) = move_file(&staging, &destination) {
            remove_quietly(&staging);
            return Err(e.into());
        }
        info!(
            "merged {} ranges of {} into {}",
            fragments.len(),
            self.key,
            destination.display()
        );
        Ok(ReconstructedFile::new(
            output_root,
            destination,
            self.origin.clone(),
            None,
        )?)
    }

    /// Deletes fragment files that were never emitted on their own.
    pub fn discard(self, fragments_were_emitted: bool) {
        if !fragments_were_emitted {
            for (_, fragment) in self.fragments.values() {
                remove_quietly(fragment.path());
            }
        }
    }
}
