//! Persistent cache store shared across builds
//!
//! Holds fetched artifacts and committed layers, content-addressed so
//! that the same inputs always map to the same entry. The store lives
//! outside every image and is never copied into one.
//!
//! # Entry States
//!
//! | State | Description |
//! |-------|-------------|
//! | Miss | Nothing stored under the key |
//! | Building | Interrupted write, ignored and overwritten |
//! | Complete | Finalized, immutable |

pub mod fetch;
pub mod lock;
pub mod store;

pub use fetch::{ArtifactFetcher, PackageFetcher};
pub use lock::FileLock;
pub use store::{
    dir_size, format_bytes, sha256_hex, CacheEntry, CacheState, CacheStore, EntryKind,
    LAYER_RECORD,
};
