//! OS label to image reference mapping.

use crate::error::{CoreError, Result};
use std::collections::BTreeMap;

/// Maps user-facing OS labels to container image references.
///
/// Labels are matched case-insensitively after trimming whitespace.
#[derive(Debug, Clone)]
pub struct ImageCatalog {
    images: BTreeMap<String, String>,
}

impl Default for ImageCatalog {
    fn default() -> Self {
        Self::empty()
            .with_image("alpine", "alpine:latest")
            .with_image("ubuntu", "ubuntu:latest")
            .with_image("debian", "debian:stable-slim")
    }
}

impl ImageCatalog {
    /// Catalog with no entries.
    pub fn empty() -> Self {
        Self {
            images: BTreeMap::new(),
        }
    }

    /// Add or replace an entry.
    pub fn with_image(mut self, label: &str, image: impl Into<String>) -> Self {
        self.images.insert(normalize(label), image.into());
        self
    }

    /// Resolve an OS label to an image reference.
    pub fn resolve(&self, label: &str) -> Result<&str> {
        self.images
            .get(&normalize(label))
            .map(String::as_str)
            .ok_or_else(|| CoreError::UnsupportedOs(label.trim().to_string()))
    }

    /// Known labels, sorted.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.images.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

fn normalize(label: &str) -> String {
    label.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_labels() {
        let catalog = ImageCatalog::default();
        assert_eq!(catalog.resolve("alpine").unwrap(), "alpine:latest");
        assert_eq!(catalog.resolve("debian").unwrap(), "debian:stable-slim");
        assert_eq!(
            catalog.labels().collect::<Vec<_>>(),
            vec!["alpine", "debian", "ubuntu"]
        );
    }

    #[test]
    fn test_resolve_is_case_insensitive() {
        let catalog = ImageCatalog::default();
        assert_eq!(catalog.resolve("  Alpine ").unwrap(), "alpine:latest");
        assert_eq!(catalog.resolve("UBUNTU").unwrap(), "ubuntu:latest");
    }

    #[test]
    fn test_unknown_label() {
        let catalog = ImageCatalog::default();
        let err = catalog.resolve(" windows ").unwrap_err();
        assert!(matches!(err, CoreError::UnsupportedOs(ref l) if l == "windows"));
        assert!(ImageCatalog::empty().resolve("alpine").is_err());
    }

    #[test]
    fn test_with_image_overrides() {
        let catalog = ImageCatalog::default().with_image("Alpine", "alpine:3.20");
        assert_eq!(catalog.resolve("alpine").unwrap(), "alpine:3.20");
    }
}
