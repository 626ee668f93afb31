//! Resource loaders
//!
//! [`FsResourceLoader`] serves scripts from a directory tree;
//! [`MemoryResourceLoader`] keeps them in a map, which embedders use for
//! scripts compiled into the binary.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use parking_lot::RwLock;

use super::{LoadError, ResourceLoader};

const URL_SCHEMES: [&str; 2] = ["file://", "zip://"];

/// Number of trailing path segments kept in script source names
const SHORT_PATH_SEGMENTS: usize = 3;

/// Shorten a resource path for use as a script source name in traces
///
/// Strips URL schemes and leading `./`, and keeps only the last few
/// segments of long paths.
pub fn shorten_script_path(path: &str) -> String {
    let mut trimmed = path.replace('\\', "/");
    for scheme in URL_SCHEMES {
        if let Some(rest) = trimmed.strip_prefix(scheme) {
            trimmed = rest.to_string();
            break;
        }
    }
    let trimmed = trimmed.trim_start_matches("./");

    let segments: Vec<&str> = trimmed.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() <= SHORT_PATH_SEGMENTS {
        return segments.join("/");
    }
    format!(
        ".../{}",
        segments[segments.len() - SHORT_PATH_SEGMENTS..].join("/")
    )
}

/// Loads resources relative to a root directory
#[derive(Debug, Clone)]
pub struct FsResourceLoader {
    root: PathBuf,
}

impl FsResourceLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(
        &self,
        path: &str,
    ) -> Result<PathBuf, LoadError> {
        let relative = path.strip_prefix("file://").unwrap_or(path);
        let relative = Path::new(relative);
        let escapes = relative.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if relative.as_os_str().is_empty() || escapes {
            return Err(LoadError::InvalidPath {
                path: path.to_string(),
            });
        }
        Ok(self.root.join(relative))
    }
}

impl ResourceLoader for FsResourceLoader {
    fn load(
        &self,
        path: &str,
    ) -> Result<Vec<u8>, LoadError> {
        let full = self.resolve(path)?;
        std::fs::read(&full).map_err(|source| match source.kind() {
            ErrorKind::NotFound => LoadError::NotFound {
                path: path.to_string(),
            },
            _ => LoadError::Io {
                path: path.to_string(),
                source,
            },
        })
    }
}

/// In-memory resource table
#[derive(Debug, Default)]
pub struct MemoryResourceLoader {
    resources: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryResourceLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a resource
    pub fn insert(
        &self,
        path: impl Into<String>,
        content: impl Into<Vec<u8>>,
    ) {
        self.resources.write().insert(path.into(), content.into());
    }

    /// Builder-style [`MemoryResourceLoader::insert`]
    pub fn with(
        self,
        path: impl Into<String>,
        content: impl Into<Vec<u8>>,
    ) -> Self {
        self.insert(path, content);
        self
    }
}

impl ResourceLoader for MemoryResourceLoader {
    fn load(
        &self,
        path: &str,
    ) -> Result<Vec<u8>, LoadError> {
        self.resources
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| LoadError::NotFound {
                path: path.to_string(),
            })
    }
}
