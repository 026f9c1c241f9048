//! Nested-catalog engine: directory-entry model, per-catalog store,
//! writable catalog manager, autocatalog balancer, and the signed manifest
//! produced by a commit.

pub mod balancer;
pub mod entry;
mod errors;
pub mod manager;
pub mod manifest;
pub mod path;
pub mod store;

pub use balancer::BalancerConfig;
pub use entry::{validate_chunk_list, DirectoryEntry, EntryKind, XattrList};
pub use errors::CatalogError;
pub use manager::{
    CatalogManagerConfig, CatalogReader, FetchError, Fetcher, WritableCatalogManager,
};
pub use manifest::{Manifest, ManifestError, SignedManifest};
pub use path::{CatalogPath, PathError};
pub use store::{CatalogStore, Counters, FinalizedCatalog, NestedLink};

#[cfg(test)]
mod tests;
