use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::store::{CatalogEntry, CatalogError};

/// Durable storage behind the catalog.
///
/// The store treats this as at-least-once durable: a successful `save_all`
/// must survive a crash immediately after it returns.
pub trait CatalogPersistence: Send {
    fn load(&self) -> Result<Vec<CatalogEntry>, CatalogError>;
    fn save_all(&self, entries: &[CatalogEntry]) -> Result<(), CatalogError>;
}

const CATALOG_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct CatalogDocument {
    version: u32,
    entries: Vec<CatalogEntry>,
}

/// Catalog stored as a single JSON document, replaced atomically on save
pub struct JsonCatalogFile {
    path: PathBuf,
}

impl JsonCatalogFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CatalogPersistence for JsonCatalogFile {
    fn load(&self) -> Result<Vec<CatalogEntry>, CatalogError> {
        if !self.path.exists() {
            log::info!(
                "No catalog at {}, starting with an empty library",
                self.path.display()
            );
            return Ok(Vec::new());
        }

        let contents = std::fs::read_to_string(&self.path)?;
        let document: CatalogDocument = serde_json::from_str(&contents)?;
        if document.version != CATALOG_VERSION {
            log::warn!(
                "Catalog {} has version {}, expected {}",
                self.path.display(),
                document.version,
                CATALOG_VERSION
            );
        }

        Ok(document.entries)
    }

    fn save_all(&self, entries: &[CatalogEntry]) -> Result<(), CatalogError> {
        let document = CatalogDocument {
            version: CATALOG_VERSION,
            entries: entries.to_vec(),
        };
        write_json_atomically(&self.path, &document)
    }
}

/// Write `value` as JSON next to `path` and rename it into place
pub(crate) fn write_json_atomically<T: Serialize>(
    path: &Path,
    value: &T,
) -> Result<(), CatalogError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let mut file = tempfile::NamedTempFile::new_in(parent)?;
    serde_json::to_writer_pretty(&mut file, value)?;
    file.write_all(b"\n")?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;

    Ok(())
}

/// In-memory persistence for tests; clones share the same backing vector
#[cfg(test)]
#[derive(Clone, Default)]
pub struct MemoryCatalog {
    pub saved: std::sync::Arc<std::sync::Mutex<Vec<CatalogEntry>>>,
    pub saves: std::sync::Arc<std::sync::atomic::AtomicUsize>,
}

#[cfg(test)]
impl CatalogPersistence for MemoryCatalog {
    fn load(&self) -> Result<Vec<CatalogEntry>, CatalogError> {
        Ok(self.saved.lock().unwrap().clone())
    }

    fn save_all(&self, entries: &[CatalogEntry]) -> Result<(), CatalogError> {
        *self.saved.lock().unwrap() = entries.to_vec();
        self.saves
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}
