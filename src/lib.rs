// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Reconstruction of files carried by captured application-layer sessions.
//!
//! Dissectors create assemblers for each transfer they recognize, register them in an
//! [`assembler::AssemblerRegistry`], and feed payload fragments in as they arrive. Finished files
//! land under the session's output directory and are reported through
//! [`session::ReconstructionEvents`].
pub mod assembler;
pub mod bounded_map;
pub mod carve;
pub mod config;
pub mod constants;
pub mod content_range;
pub mod decode;
pub mod errors;
pub mod flow;
pub mod magic;
pub mod metrics;
pub mod multipart;
pub mod reconstructed_file;
pub mod replay;
pub mod sanitize;
pub mod session;
pub mod sink;
pub mod transfer;

pub use assembler::{AssemblerRegistry, FileSegmentAssembler, FileStreamAssembler, SharedRegistry};
pub use reconstructed_file::ReconstructedFile;
pub use session::{LoggingEvents, ReconstructionEvents, Session};
