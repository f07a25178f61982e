//! Command-line and environment configuration for the server binary.

use crate::directory::{CatalogError, SpaceCatalog};
use clap::Parser;
use shared::{Dimensions, DimensionsError, DEFAULT_PORT};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about = "Real-time grid space server")]
pub struct ServerConfig {
    /// Address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on
    #[clap(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// HMAC secret used to verify session tokens
    #[clap(long, env = "JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: String,

    /// A space to serve, as id=WIDTHxHEIGHT (repeatable)
    #[clap(long = "space", value_name = "ID=WxH")]
    pub spaces: Vec<SpaceSpec>,

    /// JSON file listing spaces as [{"id", "width", "height"}]
    #[clap(long, value_name = "PATH")]
    pub spaces_file: Option<PathBuf>,

    /// Frames buffered per connection before new ones are dropped
    #[clap(long, default_value = "256")]
    pub outbox_capacity: NonZeroUsize,
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Builds the catalog from the spaces file, then the `--space` flags.
    /// A flag naming a space that is also in the file wins.
    pub fn build_catalog(&self) -> Result<SpaceCatalog, CatalogError> {
        let mut catalog = match &self.spaces_file {
            Some(path) => SpaceCatalog::load(path)?,
            None => SpaceCatalog::new(),
        };

        for spec in &self.spaces {
            catalog.insert(spec.id.clone(), spec.dimensions);
        }

        Ok(catalog)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpaceSpecError {
    #[error("expected ID=WIDTHxHEIGHT, got {0:?}")]
    MissingSeparator(String),
    #[error("space id must not be empty")]
    EmptyId,
    #[error(transparent)]
    Dimensions(#[from] DimensionsError),
}

/// One `--space` flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceSpec {
    pub id: String,
    pub dimensions: Dimensions,
}

impl FromStr for SpaceSpec {
    type Err = SpaceSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, dimensions) = s
            .rsplit_once('=')
            .ok_or_else(|| SpaceSpecError::MissingSeparator(s.to_string()))?;

        let id = id.trim();
        if id.is_empty() {
            return Err(SpaceSpecError::EmptyId);
        }

        Ok(SpaceSpec {
            id: id.to_string(),
            dimensions: dimensions.trim().parse()?,
        })
    }
}
