//! ISO catalog - install media available to new VMs.
//!
//! The catalog is a plain directory scan; nothing is cached, so files added
//! or removed outside the service show up on the next listing.

use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// Lists `*.iso` files in one directory.
#[derive(Debug, Clone)]
pub struct IsoCatalog {
    path: PathBuf,
}

impl IsoCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Filenames of the ISO images in the catalog directory, sorted.
    ///
    /// A missing directory is reported as an empty catalog.
    pub async fn list(&self) -> anyhow::Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %self.path.display(), "ISO directory does not exist");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut isos = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !is_iso(&path) {
                continue;
            }
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = path.file_name() {
                isos.push(name.to_string_lossy().into_owned());
            }
        }

        isos.sort();
        debug!(path = %self.path.display(), count = isos.len(), "Scanned ISO directory");
        Ok(isos)
    }
}

fn is_iso(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("iso"))
        .unwrap_or(false)
}
