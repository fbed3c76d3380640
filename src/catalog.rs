//! Product catalog persisted as `{"products": [{"ItemName": ...}, ...]}`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog file {0} does not exist, run `prodmatch refresh` first")]
    Missing(PathBuf),

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("catalog file {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("unexpected catalog payload: {0}")]
    UnexpectedPayload(String),

    #[error("catalog payload contains no products")]
    Empty,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRecord {
    #[serde(rename = "ItemName")]
    pub name: String,
}

impl ProductRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    pub products: Vec<ProductRecord>,
}

impl CatalogSnapshot {
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            products: names.into_iter().map(ProductRecord::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }

    /// SHA-256 over the ordered product names, stored alongside the index
    /// to detect that it was built from another catalog.
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for product in &self.products {
            hasher.update(product.name.as_bytes());
            hasher.update([0u8]);
        }
        hasher.finalize().into()
    }

    /// Normalize an upstream query result.
    ///
    /// Accepts a list of `{"ItemName": ..}` objects, a list of strings, a mix
    /// of both, or an already wrapped `{"products": [..]}` document. Items of
    /// any other shape are skipped.
    pub fn from_upstream(payload: Value) -> Result<Self, CatalogError> {
        let items = match payload {
            Value::Array(items) => items,
            Value::Object(mut map) => match map.remove("products") {
                Some(Value::Array(items)) => items,
                Some(other) => {
                    return Err(CatalogError::UnexpectedPayload(format!(
                        "\"products\" is {}, expected a list",
                        json_kind(&other)
                    )))
                }
                None => {
                    return Err(CatalogError::UnexpectedPayload(
                        "object without a \"products\" key".to_string(),
                    ))
                }
            },
            other => {
                return Err(CatalogError::UnexpectedPayload(format!(
                    "got {}, expected a list of products",
                    json_kind(&other)
                )))
            }
        };

        let total = items.len();
        let products: Vec<ProductRecord> = items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(name) => Some(name),
                Value::Object(mut map) => match map.remove("ItemName") {
                    Some(Value::String(name)) => Some(name),
                    _ => None,
                },
                _ => None,
            })
            .filter(|name| !name.trim().is_empty())
            .map(ProductRecord::new)
            .collect();

        if products.len() < total {
            log::warn!(
                "skipped {} of {} catalog items with an unexpected shape",
                total - products.len(),
                total
            );
        }

        if products.is_empty() {
            return Err(CatalogError::Empty);
        }

        Ok(Self { products })
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

/// Catalog file on disk.
pub struct CatalogStore {
    path: PathBuf,
}

impl CatalogStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn load(&self) -> Result<CatalogSnapshot, CatalogError> {
        let data = std::fs::read(&self.path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                CatalogError::Missing(self.path.clone())
            } else {
                CatalogError::Io {
                    path: self.path.clone(),
                    source,
                }
            }
        })?;

        serde_json::from_slice(&data).map_err(|source| CatalogError::Malformed {
            path: self.path.clone(),
            source,
        })
    }

    /// Modification time of the catalog file, if it exists.
    pub fn modified(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .ok()
    }

    /// Replace the catalog, copying the current file to a timestamped backup
    /// first. Returns the backup path when one was written.
    pub fn save(&self, snapshot: &CatalogSnapshot) -> Result<Option<PathBuf>, CatalogError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| CatalogError::Io { path, source }
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err(parent))?;
        }

        let backup = if self.path.exists() {
            let backup_path = self.backup_path();
            std::fs::copy(&self.path, &backup_path).map_err(io_err(&backup_path))?;
            log::info!("catalog backup written to {}", backup_path.display());
            Some(backup_path)
        } else {
            None
        };

        let data = serde_json::to_vec_pretty(snapshot).map_err(|source| CatalogError::Malformed {
            path: self.path.clone(),
            source,
        })?;

        let temp_path = self.path.with_extension("json.tmp");
        let write = || -> std::io::Result<()> {
            let mut file = std::fs::File::create(&temp_path)?;
            file.write_all(&data)?;
            file.sync_all()?;
            std::fs::rename(&temp_path, &self.path)
        };

        if let Err(source) = write() {
            let _ = std::fs::remove_file(&temp_path);
            return Err(CatalogError::Io {
                path: self.path.clone(),
                source,
            });
        }

        log::info!(
            "catalog {} updated with {} products",
            self.path.display(),
            snapshot.len()
        );

        Ok(backup)
    }

    /// `products_backup_YYYYMMDD_HHMMSS.json`, suffixed when two backups land
    /// in the same second.
    fn backup_path(&self) -> PathBuf {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "products".to_string());
        let timestamp = Local::now().format("%Y%m%d_%H%M%S");

        let mut candidate = dir.join(format!("{stem}_backup_{timestamp}.json"));
        let mut n = 1;
        while candidate.exists() {
            candidate = dir.join(format!("{stem}_backup_{timestamp}_{n}.json"));
            n += 1;
        }
        candidate
    }
}
