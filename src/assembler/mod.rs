// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Reconstruction units and the registry that tracks them.
//!
//! Stream assemblers take sequence-tagged fragments, segment assemblers take offset-tagged
//! fragments. Both finish into a [`ReconstructedFile`] that is either emitted directly or merged
//! with other byte ranges of the same file by a [`PartialFileAssembler`].
pub mod partial;
pub mod registry;
pub mod segment;
pub mod stream;

#[cfg(test)]
pub mod tests;

pub use partial::PartialFileAssembler;
pub use registry::{Assembler, AssemblerRegistry, SharedRegistry};
pub use segment::{FileSegmentAssembler, SegmentError, SegmentProgress};
pub use stream::{FileStreamAssembler, FileStreamAssemblerBuilder, Progress};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

use crate::bounded_map::BoundedMap;
use crate::constants::MAX_PATH_LENGTH;
use crate::content_range::ContentRange;
use crate::errors::{Error, Result};
use crate::metrics::PARTIAL_MERGES;
use crate::reconstructed_file::{ReconstructedFile, TransferOrigin};
use crate::session::Session;
use crate::transfer::AssemblyRoot;

/// What a finishing assembler needs from its surroundings. Multipart children are finished
/// with a reborrow of their parent's context.
pub struct FinalizeContext<'a> {
    pub session: &'a Session,
    pub partials: &'a mut BoundedMap<String, PartialFileAssembler>,
}

fn path_component(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            c if c.is_ascii_alphanumeric() || c == '.' || c == '-' => c,
            ':' => '-',
            _ => '_',
        })
        .collect()
}

/// Fresh scratch file in the session cache directory. The uuid keeps a queued assembler for
/// the same transfer from truncating the active one's file.
pub(crate) fn scratch_path(session: &Session, origin: &TransferOrigin) -> PathBuf {
    let name = format!(
        "{}-{}-{}-{}.tmp",
        path_component(&origin.flow.source(origin.direction).to_string()),
        path_component(&origin.flow.destination(origin.direction).to_string()),
        origin.transfer_type.protocol_dir(),
        Uuid::new_v4().simple()
    );
    session.cache_dir().join(name)
}

/// Creates the parent directories of the file a transfer is written to and returns its path,
/// before collision resolution.
///
/// Layout is `<protocol>/<host>/<TCP|UDP>-<port>/<location>/<filename>` under the output root,
/// or `cache/<filename>` for [`AssemblyRoot::Cache`].
pub(crate) fn output_path(
    session: &Session,
    origin: &TransferOrigin,
    root: AssemblyRoot,
    location: &str,
    filename: &str,
) -> Result<PathBuf> {
    let directory = match root {
        AssemblyRoot::Cache => session.cache_dir(),
        AssemblyRoot::Source | AssemblyRoot::Destination => {
            let endpoint = if root == AssemblyRoot::Source {
                origin.flow.source(origin.direction)
            } else {
                origin.flow.destination(origin.direction)
            };
            let mut directory = session
                .output_dir()
                .join(origin.transfer_type.protocol_dir())
                .join(endpoint.ip().to_string().replace(':', "-"))
                .join(format!("{}-{}", origin.flow.transport, endpoint.port()));
            directory.extend(location.split('/').filter(|s| !s.is_empty()));
            directory
        }
    };
    let path = directory.join(filename);
    if path.as_os_str().len() > MAX_PATH_LENGTH {
        return Err(Error::PathTooLong(path));
    }
    fs::create_dir_all(&directory)?;
    Ok(path)
}

/// Moves `from` to `to`, copying when a rename is not possible (e.g. across filesystems).
pub(crate) fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)
}

pub(crate) fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("removed {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => debug!("could not remove {}: {e}", path.display()),
    }
}

/// Groups byte ranges of one logical file: the transfer details (usually the URL) or, without
/// them, the sending host, plus the total size.
pub(crate) fn partial_key(origin: &TransferOrigin, total: u64) -> String {
    let base = if origin.details.is_empty() {
        origin.flow.source(origin.direction).ip().to_string()
    } else {
        origin.details.clone()
    };
    format!("{base}|{total}")
}

/// Emits a finished file, or merges it with its sibling ranges when it only covers part of a
/// larger file. Returns everything emitted.
pub(crate) fn deliver(
    ctx: &mut FinalizeContext<'_>,
    file: ReconstructedFile,
    range: Option<ContentRange>,
    intended_path: &Path,
) -> Vec<ReconstructedFile> {
    let session = ctx.session;
    let extract_partial = session.config().extract_partial_downloads;

    let Some(range) = range.filter(|r| !r.is_complete_file()) else {
        return session.emit(file);
    };
    let Some(total) = range.total else {
        if extract_partial {
            return session.emit(file);
        }
        debug!("dropping range {range} of unknown total size");
        remove_quietly(file.path());
        return Vec::new();
    };

    let mut emitted = if extract_partial {
        session.emit(file.clone())
    } else {
        Vec::new()
    };

    let key = partial_key(file.origin(), total);
    if !ctx.partials.contains_key(&key) {
        let partial = PartialFileAssembler::new(
            key.clone(),
            total,
            intended_path.to_path_buf(),
            file.origin().clone(),
        );
        ctx.partials.insert(key.clone(), partial);
    }
    let Some(partial) = ctx.partials.get_mut(&key) else {
        return emitted;
    };
    if let Err(e) = partial.add_file(range, file) {
        session.report_anomaly(&e.to_string());
        return emitted;
    }
    if !partial.is_complete() {
        return emitted;
    }
    match partial.reassemble(session.output_dir(), extract_partial) {
        Ok(merged) => {
            PARTIAL_MERGES.inc();
            emitted.extend(session.emit(merged));
        }
        Err(e) => session.report_anomaly(&format!("error merging {key}: {e}")),
    }
    ctx.partials.remove(&key);
    emitted
}
