//! Space metadata lookup.

use serde::Deserialize;
use shared::{Dimensions, DimensionsError};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("space {0} not found")]
    NotFound(String),
    #[error("space directory unavailable: {0}")]
    Unavailable(String),
}

/// Resolves a space id to its grid dimensions.
pub trait SpaceDirectory: Send + Sync {
    fn resolve(&self, space_id: &str) -> Result<Dimensions, DirectoryError>;
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read spaces file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse spaces file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("space {id}: {source}")]
    Dimensions {
        id: String,
        #[source]
        source: DimensionsError,
    },
    #[error("space id must not be empty")]
    EmptyId,
}

#[derive(Debug, Deserialize)]
struct SpaceRecord {
    id: String,
    width: u32,
    height: u32,
}

/// In-memory directory of the spaces this process serves.
#[derive(Debug, Clone, Default)]
pub struct SpaceCatalog {
    spaces: HashMap<String, Dimensions>,
}

impl SpaceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a space, returning the dimensions it replaced.
    pub fn insert(&mut self, space_id: impl Into<String>, dimensions: Dimensions) -> Option<Dimensions> {
        self.spaces.insert(space_id.into(), dimensions)
    }

    pub fn with_space(mut self, space_id: impl Into<String>, dimensions: Dimensions) -> Self {
        self.insert(space_id, dimensions);
        self
    }

    /// Parses a JSON array of `{"id", "width", "height"}` records.
    pub fn from_json_str(json: &str) -> Result<Self, CatalogError> {
        let records: Vec<SpaceRecord> = serde_json::from_str(json)?;
        let mut catalog = Self::new();

        for record in records {
            if record.id.is_empty() {
                return Err(CatalogError::EmptyId);
            }
            let dimensions = Dimensions::new(record.width, record.height).map_err(|source| {
                CatalogError::Dimensions {
                    id: record.id.clone(),
                    source,
                }
            })?;
            catalog.insert(record.id, dimensions);
        }

        Ok(catalog)
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn len(&self) -> usize {
        self.spaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spaces.is_empty()
    }
}

impl SpaceDirectory for SpaceCatalog {
    fn resolve(&self, space_id: &str) -> Result<Dimensions, DirectoryError> {
        self.spaces
            .get(space_id)
            .copied()
            .ok_or_else(|| DirectoryError::NotFound(space_id.to_string()))
    }
}
