//! Video library catalog
//!
//! The catalog maps a stable [`VideoId`] to everything known about a clip:
//! its title, where its cached file lives, and where it sits in the
//! user-defined ordering. It is the single source of truth consulted before
//! every playback or download decision, so every write goes straight to the
//! persistence backend.
//!
//! - `id`: video identifiers and extraction from remote references
//! - `persistence`: the narrow load/save interface plus the JSON file backend
//! - `store`: [`CacheStore`], the only owner of [`CatalogEntry`] values

mod id;
mod persistence;
mod store;

pub use id::VideoId;
pub use persistence::{CatalogPersistence, JsonCatalogFile};
pub(crate) use persistence::write_json_atomically;
pub use store::{CacheStore, CatalogEntry, CatalogError, EntryUpdate};

#[cfg(test)]
pub use persistence::MemoryCatalog;
