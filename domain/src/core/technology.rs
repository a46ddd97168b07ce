//! Technology value object

use serde::{Deserialize, Serialize};

use super::error::DomainError;

/// A named technology (Value Object)
///
/// Identifies one locally cloned source repository that backend agent
/// instances answer questions about. Display form keeps the caller's
/// casing; [`Technology::key`] is the canonical form used for pool,
/// session, and cache bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Technology {
    name: String,
}

impl Technology {
    /// Create a new technology name
    ///
    /// # Panics
    /// Panics if the name is empty or only whitespace
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        assert!(!name.trim().is_empty(), "Technology name cannot be empty");
        Self {
            name: name.trim().to_string(),
        }
    }

    /// Try to create a new technology name, returning None if invalid
    pub fn try_new(name: impl Into<String>) -> Option<Self> {
        let name = name.into();
        let trimmed = name.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self {
                name: trimmed.to_string(),
            })
        }
    }

    /// Parse a technology name, reporting why it was rejected
    pub fn parse(name: &str) -> Result<Self, DomainError> {
        Self::try_new(name)
            .ok_or_else(|| DomainError::InvalidTechnology("name is empty".to_string()))
    }

    /// Get the technology name as given
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// Canonical lowercase key used by pools and caches
    pub fn key(&self) -> String {
        self.name.to_lowercase()
    }
}

impl std::fmt::Display for Technology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl From<&str> for Technology {
    fn from(s: &str) -> Self {
        Technology::new(s)
    }
}

impl From<String> for Technology {
    fn from(s: String) -> Self {
        Technology::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_technology_creation() {
        let tech = Technology::new("react");
        assert_eq!(tech.as_str(), "react");
    }

    #[test]
    fn test_technology_trims_whitespace() {
        let tech = Technology::new("  tokio  ");
        assert_eq!(tech.as_str(), "tokio");
    }

    #[test]
    fn test_key_is_lowercase() {
        let tech = Technology::new("React");
        assert_eq!(tech.key(), "react");
        assert_eq!(tech.as_str(), "React");
    }

    #[test]
    #[should_panic]
    fn test_empty_technology_panics() {
        Technology::new("   ");
    }

    #[test]
    fn test_try_new_empty() {
        assert!(Technology::try_new("").is_none());
        assert!(Technology::try_new("  ").is_none());
    }

    #[test]
    fn test_parse_reports_error() {
        assert!(Technology::parse("").is_err());
        assert!(Technology::parse("vue").is_ok());
    }
}
