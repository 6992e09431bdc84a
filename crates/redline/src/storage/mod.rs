pub mod file_store;

pub use file_store::{sha256_hex, FileKind, FileRecord, FileStore};
