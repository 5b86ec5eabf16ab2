//! Repository and tag reference parsing.
//!
//! Parses references like `quay.io/ns/app:1.0` into a registry host, a
//! repository path and a tag. A registry host is always required.

use std::fmt;

use crate::error::RegistryError;

/// A repository coordinate: registry host plus repository path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Repository {
    /// Registry hostname, optionally with port (e.g. "quay.io", "localhost:5000").
    pub registry: String,
    /// Repository path (e.g. "ns/app").
    pub name: String,
}

impl Repository {
    /// Creates a repository coordinate.
    #[must_use]
    pub fn new(registry: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            registry: registry.into(),
            name: name.into(),
        }
    }

    /// Parses `<host>/<path>`.
    ///
    /// # Examples
    ///
    /// ```
    /// use ocisync_registry::Repository;
    ///
    /// let repo = Repository::parse("quay.io/ns/app").unwrap();
    /// assert_eq!(repo.registry, "quay.io");
    /// assert_eq!(repo.name, "ns/app");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidReference`] if the host is missing,
    /// the path is empty, or a tag or digest is present.
    pub fn parse(input: &str) -> Result<Self, RegistryError> {
        let input = input.trim();
        let repository = split_registry(input)?;

        if repository.name.contains('@') || last_segment(&repository.name).contains(':') {
            return Err(invalid(input, "repository must not carry a tag or digest"));
        }
        validate_path(input, &repository.name)?;

        Ok(repository)
    }
}

impl fmt::Display for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.name)
    }
}

/// A tagged reference: repository coordinate plus tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    /// Repository coordinate.
    pub repository: Repository,
    /// Tag name.
    pub tag: String,
}

impl Reference {
    /// Creates a tagged reference.
    #[must_use]
    pub fn new(repository: Repository, tag: impl Into<String>) -> Self {
        Self {
            repository,
            tag: tag.into(),
        }
    }

    /// Parses `<host>/<path>:<tag>`.
    ///
    /// The tag separator is the last `:` after the last `/`, so registry
    /// ports are handled (`localhost:5000/ns/app:1.0`).
    ///
    /// # Examples
    ///
    /// ```
    /// use ocisync_registry::Reference;
    ///
    /// let reference = Reference::parse("registry.example/ns/name:1.0").unwrap();
    /// assert_eq!(reference.repository.name, "ns/name");
    /// assert_eq!(reference.tag, "1.0");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidReference`] if the host or tag is missing.
    pub fn parse(input: &str) -> Result<Self, RegistryError> {
        let input = input.trim();
        let repository = split_registry(input)?;

        let segment_start = repository.name.rfind('/').map_or(0, |pos| pos + 1);
        let Some(colon) = repository.name[segment_start..].rfind(':') else {
            return Err(invalid(input, "tag is missing"));
        };
        let split_at = segment_start + colon;
        let name = &repository.name[..split_at];
        let tag = &repository.name[split_at + 1..];

        if tag.is_empty() {
            return Err(invalid(input, "tag is missing"));
        }
        if !is_valid_tag(tag) {
            return Err(invalid(input, "tag contains invalid characters"));
        }
        validate_path(input, name)?;

        Ok(Self {
            repository: Repository::new(repository.registry, name),
            tag: tag.to_string(),
        })
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

/// Extracts the repository path and tag from `<host>/<path>:<tag>`.
///
/// # Errors
///
/// Returns a validation error if the host prefix or the tag is missing.
pub fn parse_repo_and_tag(input: &str) -> Result<(String, String), RegistryError> {
    let reference = Reference::parse(input)?;
    Ok((reference.repository.name, reference.tag))
}

/// Returns true when the first path component names a registry host.
fn looks_like_host(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

fn split_registry(input: &str) -> Result<Repository, RegistryError> {
    if input.is_empty() {
        return Err(invalid(input, "reference is empty"));
    }

    let Some((host, rest)) = input.split_once('/') else {
        return Err(invalid(input, "registry host is missing"));
    };

    if !looks_like_host(host) {
        return Err(invalid(input, "registry host is missing"));
    }

    Ok(Repository::new(host, rest))
}

fn validate_path(input: &str, path: &str) -> Result<(), RegistryError> {
    if path.is_empty() {
        return Err(invalid(input, "repository path is empty"));
    }

    let valid = path.split('/').all(|component| {
        !component.is_empty()
            && component != "."
            && component != ".."
            && component
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-".contains(c))
    });

    if valid {
        Ok(())
    } else {
        Err(invalid(input, "repository path contains invalid components"))
    }
}

/// Returns true if `tag` matches `[A-Za-z0-9_][A-Za-z0-9._-]{0,127}`.
///
/// A valid tag is always a single normal path component.
#[must_use]
pub fn is_valid_tag(tag: &str) -> bool {
    let mut chars = tag.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    tag.len() <= 128
        && (first.is_ascii_alphanumeric() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || "._-".contains(c))
}

fn last_segment(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn invalid(input: &str, reason: &str) -> RegistryError {
    RegistryError::InvalidReference {
        reference: input.to_string(),
        reason: reason.to_string(),
    }
}
