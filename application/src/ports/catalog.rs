//! Technology catalog port.
//!
//! The catalog maps user-facing technology names ("react", "tokio") to
//! local repository checkouts the agent can read. Lookup failures carry
//! near-miss suggestions so the caller can surface a useful message.

use std::path::PathBuf;
use thiserror::Error;

/// One registered technology.
#[derive(Debug, Clone, PartialEq)]
pub struct TechnologyEntry {
    /// Canonical name, as registered.
    pub name: String,
    /// Local checkout of the technology's source repository.
    pub repo_path: PathBuf,
    /// Optional one-line description for listings.
    pub description: Option<String>,
}

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("technology not found: '{name}'")]
    NotFound {
        name: String,
        /// Registered names close enough to be a likely typo.
        suggestions: Vec<String>,
    },

    #[error("repository for '{name}' is missing at {}", .path.display())]
    RepoMissing { name: String, path: PathBuf },

    #[error("catalog unavailable: {0}")]
    Unavailable(String),
}

/// Read-only registry of known technologies.
pub trait TechnologyCatalog: Send + Sync {
    /// Resolves a name (case-insensitive) to its catalog entry.
    fn resolve(&self, name: &str) -> Result<TechnologyEntry, CatalogError>;

    /// All registered technologies, sorted by name.
    fn list(&self) -> Vec<TechnologyEntry>;
}
