//! Remote store collaborator for the bundle pipeline.
//!
//! [`RemoteStore`] is the narrow interface the pipeline talks to. [`LocalStore`]
//! implements it over a local directory, and [`MetadataCache`] memoizes
//! existence/stat/listing lookups in front of any store.

mod cache;
mod error;
mod local;
pub mod path;
mod remote;
mod types;

pub use cache::{DIRECT_STAT_DEPTH, MetadataCache};
pub use error::StoreError;
pub use local::LocalStore;
pub use remote::{RemoteStore, StoreFuture};
pub use types::{ArchiveKind, ByteProgressFn, EntryKind, RemoteEntry, UploadOptions};
