//! Common types used throughout the storage crates.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use zeroize::Zeroize;

/// A path inside a storage provider, independent of the underlying backend.
///
/// This type represents logical record locations (`/capa/2024/CAPA-0012.pdf`),
/// not physical filesystem paths. Components that could escape the provider
/// root (`.`, `..`) are rejected at construction, deserialization included.
/// Serialized as its string form (`/capa/2024/CAPA-0012.pdf`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoragePath {
    components: Vec<String>,
}

impl StoragePath {
    /// Create a root path.
    pub fn root() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    fn validate_component(comp: &str) -> crate::Result<()> {
        if comp.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Path component cannot be empty".to_string(),
            ));
        }
        if comp == "." || comp == ".." {
            return Err(crate::Error::InvalidInput(format!(
                "Path component '{}' is not allowed",
                comp
            )));
        }
        if comp.contains('/') || comp.contains('\\') {
            return Err(crate::Error::InvalidInput(
                "Path component cannot contain separators".to_string(),
            ));
        }
        if comp.contains('\0') {
            return Err(crate::Error::InvalidInput(
                "Path component cannot contain NUL".to_string(),
            ));
        }
        Ok(())
    }

    /// Create a path from string components.
    ///
    /// # Errors
    /// - Returns error if any component is empty, `.`/`..`, or contains a
    ///   separator or NUL byte
    pub fn from_components(components: Vec<String>) -> crate::Result<Self> {
        for comp in &components {
            Self::validate_component(comp)?;
        }
        Ok(Self { components })
    }

    /// Parse a path string into a StoragePath.
    ///
    /// Uses '/' as separator. Leading and trailing separators are ignored.
    pub fn parse(path: &str) -> crate::Result<Self> {
        let path = path.trim_start_matches('/').trim_end_matches('/');
        if path.is_empty() {
            return Ok(Self::root());
        }

        let components: Vec<String> = path.split('/').map(String::from).collect();
        Self::from_components(components)
    }

    /// Check if this is the root path.
    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Get the parent path, if any.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            None
        } else {
            let mut components = self.components.clone();
            components.pop();
            Some(Self { components })
        }
    }

    /// Get the file/directory name (last component).
    pub fn name(&self) -> Option<&str> {
        self.components.last().map(|s| s.as_str())
    }

    /// Join this path with a child component.
    pub fn join(&self, child: &str) -> crate::Result<Self> {
        Self::validate_component(child)?;
        let mut components = self.components.clone();
        components.push(child.to_string());
        Ok(Self { components })
    }

    /// Replace the last component, keeping the parent.
    pub fn with_name(&self, name: &str) -> crate::Result<Self> {
        match self.parent() {
            Some(parent) => parent.join(name),
            None => Err(crate::Error::InvalidInput(
                "Root path has no name to replace".to_string(),
            )),
        }
    }

    /// Check whether `other` lies strictly below this path.
    pub fn is_ancestor_of(&self, other: &StoragePath) -> bool {
        other.components.len() > self.components.len()
            && other.components[..self.components.len()] == self.components[..]
    }

    /// Get the path components.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Convert to a string representation.
    pub fn to_string_path(&self) -> String {
        if self.is_root() {
            "/".to_string()
        } else {
            format!("/{}", self.components.join("/"))
        }
    }

    /// Path without the leading separator, as object stores key objects.
    pub fn to_key(&self) -> String {
        self.components.join("/")
    }
}

impl fmt::Display for StoragePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_path())
    }
}

impl Serialize for StoragePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string_path())
    }
}

impl<'de> Deserialize<'de> for StoragePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Credential string that zeroizes on drop and never prints its value.
///
/// Used for access keys, client secrets and bearer tokens in provider
/// configuration.
#[derive(Clone, Default, PartialEq, Eq, Zeroize)]
#[zeroize(drop)]
pub struct SecretString(String);

impl SecretString {
    /// Wrap a secret value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the secret for use in a request.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretString([REDACTED])")
    }
}

impl Serialize for SecretString {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SecretString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self)
    }
}
