use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// a single path element - non-empty, no separator, not `.` or `..`
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PathComponent(String);

impl PathComponent {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_component(&name)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn validate_component(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("empty path component".to_string()));
    }
    if name.contains('/') {
        return Err(Error::InvalidArgument(format!(
            "path component contains '/': {}",
            name
        )));
    }
    if name.contains('\0') {
        return Err(Error::InvalidArgument(format!(
            "path component contains null byte: {}",
            name
        )));
    }
    if name == "." || name == ".." {
        return Err(Error::InvalidArgument(format!(
            "reserved path component: {}",
            name
        )));
    }
    Ok(())
}

impl TryFrom<String> for PathComponent {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        PathComponent::new(value)
    }
}

impl std::borrow::Borrow<str> for PathComponent {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<PathComponent> for String {
    fn from(value: PathComponent) -> Self {
        value.0
    }
}

impl fmt::Display for PathComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PathComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PathComponent({:?})", self.0)
    }
}

/// a path relative to the mount root - zero or more components, no `.` or `..`
///
/// the empty relative path names the root itself.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelativePath(String);

impl RelativePath {
    /// the empty path (the mount root)
    pub fn root() -> Self {
        Self(String::new())
    }

    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        if path.is_empty() {
            return Ok(Self(path));
        }
        if path.starts_with('/') || path.ends_with('/') {
            return Err(Error::InvalidArgument(format!(
                "relative path has leading or trailing separator: {}",
                path
            )));
        }
        for component in path.split('/') {
            validate_component(component)?;
        }
        Ok(Self(path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// iterate over the components, front to back
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|c| !c.is_empty())
    }

    /// append a single component
    pub fn join(&self, component: &PathComponent) -> RelativePath {
        if self.0.is_empty() {
            RelativePath(component.as_str().to_string())
        } else {
            RelativePath(format!("{}/{}", self.0, component.as_str()))
        }
    }

    /// append another relative path
    pub fn join_path(&self, other: &RelativePath) -> RelativePath {
        if self.0.is_empty() {
            other.clone()
        } else if other.0.is_empty() {
            self.clone()
        } else {
            RelativePath(format!("{}/{}", self.0, other.0))
        }
    }

    /// split into `(parent, basename)`; `None` for the root
    pub fn split(&self) -> Option<(RelativePath, PathComponent)> {
        if self.0.is_empty() {
            return None;
        }
        match self.0.rfind('/') {
            Some(idx) => Some((
                RelativePath(self.0[..idx].to_string()),
                PathComponent(self.0[idx + 1..].to_string()),
            )),
            None => Some((RelativePath::root(), PathComponent(self.0.clone()))),
        }
    }

    /// final component; `None` for the root
    pub fn basename(&self) -> Option<PathComponent> {
        self.split().map(|(_, base)| base)
    }
}

impl From<PathComponent> for RelativePath {
    fn from(component: PathComponent) -> Self {
        RelativePath(component.0)
    }
}

impl TryFrom<String> for RelativePath {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        RelativePath::new(value)
    }
}

impl From<RelativePath> for String {
    fn from(value: RelativePath) -> Self {
        value.0
    }
}

impl fmt::Display for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RelativePath({:?})", self.0)
    }
}

/// an absolute filesystem path - starts with `/`, canonical form
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AbsolutePath(String);

impl AbsolutePath {
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        if !path.starts_with('/') {
            return Err(Error::InvalidArgument(format!(
                "absolute path must start with '/': {}",
                path
            )));
        }
        if path == "/" {
            return Ok(Self(path));
        }
        if path.ends_with('/') {
            return Err(Error::InvalidArgument(format!(
                "absolute path has trailing separator: {}",
                path
            )));
        }
        for component in path[1..].split('/') {
            validate_component(component)?;
        }
        Ok(Self(path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// append a relative path
    pub fn join(&self, rel: &RelativePath) -> AbsolutePath {
        if rel.is_root() {
            self.clone()
        } else if self.0 == "/" {
            AbsolutePath(format!("/{}", rel.as_str()))
        } else {
            AbsolutePath(format!("{}/{}", self.0, rel.as_str()))
        }
    }

    /// append a single component
    pub fn join_component(&self, component: &PathComponent) -> AbsolutePath {
        if self.0 == "/" {
            AbsolutePath(format!("/{}", component.as_str()))
        } else {
            AbsolutePath(format!("{}/{}", self.0, component.as_str()))
        }
    }

    /// express `other` relative to `self`; fails unless `other` is under `self`
    pub fn relativize(&self, other: &AbsolutePath) -> Result<RelativePath> {
        if other.0 == self.0 {
            return Ok(RelativePath::root());
        }
        let prefix = if self.0 == "/" {
            "/".to_string()
        } else {
            format!("{}/", self.0)
        };
        match other.0.strip_prefix(&prefix) {
            Some(rest) => Ok(RelativePath(rest.to_string())),
            None => Err(Error::InvalidArgument(format!(
                "{} is not under {}",
                other.0, self.0
            ))),
        }
    }

    pub fn to_path_buf(&self) -> std::path::PathBuf {
        std::path::PathBuf::from(&self.0)
    }
}

impl TryFrom<String> for AbsolutePath {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        AbsolutePath::new(value)
    }
}

impl From<AbsolutePath> for String {
    fn from(value: AbsolutePath) -> Self {
        value.0
    }
}

impl fmt::Display for AbsolutePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for AbsolutePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AbsolutePath({:?})", self.0)
    }
}
