// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Common constants used mostly by the `assembler` and `sanitize` modules
pub const DEFAULT_REGISTRY_CAPACITY: usize = 100;
pub const OUT_OF_ORDER_WINDOW: usize = 64;
pub const SNIFF_FRAGMENT_LIMIT: usize = 5;
pub const MAX_FILENAME_LENGTH: usize = 20;
pub const MAX_LOCATION_LENGTH: usize = 40;
pub const MAX_PATH_LENGTH: usize = 4096;
pub const CACHE_DIR_NAME: &str = "cache";
pub const CHUNK_TRAILER: &[u8] = b"0\r\n\r\n";
pub const COPY_BUFFER_SIZE: usize = 64 * 1024;
