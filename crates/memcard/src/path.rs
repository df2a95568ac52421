//! Absolute slash-separated paths.

use crate::device::BlockAdapter;
use crate::dir_entry::{DirectoryEntry, MAX_NAME_LEN};
use crate::session::Session;
use crate::{Error, Result};

/// Where a resolved entry's record lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// The root directory, which has no record in any parent.
    Root,
    /// Slot `slot` of the directory starting at cluster `parent`.
    Slot { parent: u32, slot: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub entry: DirectoryEntry,
    pub location: Location,
}

/// Non-empty components of an absolute path.
pub fn components(path: &str) -> Result<Vec<&str>> {
    if !path.starts_with('/') {
        return Err(Error::NotFound(path.to_string()));
    }
    let parts: Vec<&str> = path.split('/').filter(|part| !part.is_empty()).collect();
    if parts.iter().any(|&part| part == "." || part == "..") {
        return Err(Error::NotFound(path.to_string()));
    }
    Ok(parts)
}

pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.len() > MAX_NAME_LEN
        || name.contains('\0')
        || name.contains('/')
        || name == "."
        || name == ".."
    {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Splits a path into its parent directory and a validated leaf name.
pub fn split_parent(path: &str) -> Result<(String, String)> {
    let mut parts = components(path)?;
    let leaf = parts.pop().ok_or_else(|| Error::InvalidName(path.to_string()))?;
    validate_name(leaf)?;
    Ok((format!("/{}", parts.join("/")), leaf.to_string()))
}

impl<D: BlockAdapter> Session<D> {
    /// Walks `path` from the root, matching names case-sensitively.
    pub fn resolve(&mut self, path: &str) -> Result<Resolved> {
        let parts = components(path)?;
        let mut resolved = Resolved {
            entry: self.root_entry()?,
            location: Location::Root,
        };
        for (depth, part) in parts.iter().enumerate() {
            if !resolved.entry.is_dir() {
                return Err(Error::NotDirectory(format!("/{}", parts[..depth].join("/"))));
            }
            let parent = resolved.entry.cluster;
            let dir = self.load_dir(parent)?;
            let (slot, entry) = dir
                .find(part)
                .ok_or_else(|| Error::NotFound(path.to_string()))?;
            resolved = Resolved {
                entry: entry.clone(),
                location: Location::Slot { parent, slot },
            };
        }
        Ok(resolved)
    }

    /// Resolves `path` and requires a directory there.
    pub(crate) fn resolve_dir(&mut self, path: &str) -> Result<Resolved> {
        let resolved = self.resolve(path)?;
        if !resolved.entry.is_dir() {
            return Err(Error::NotDirectory(path.to_string()));
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_components_are_dropped() {
        assert_eq!(components("//A///B/").expect("components"), vec!["A", "B"]);
        assert!(components("/").expect("root").is_empty());
    }

    #[test]
    fn relative_paths_are_not_found() {
        assert!(matches!(components("A/B"), Err(Error::NotFound(_))));
        assert!(matches!(components(""), Err(Error::NotFound(_))));
        assert!(matches!(components("/A/../B"), Err(Error::NotFound(_))));
    }

    #[test]
    fn split_yields_parent_and_leaf() {
        assert_eq!(
            split_parent("/BESLES-12345/icon.sys").expect("split"),
            ("/BESLES-12345".to_string(), "icon.sys".to_string())
        );
        assert_eq!(
            split_parent("/SAVE").expect("split"),
            ("/".to_string(), "SAVE".to_string())
        );
    }

    #[test]
    fn bad_leaf_names_are_rejected() {
        assert!(matches!(split_parent("/"), Err(Error::InvalidName(_))));
        assert!(matches!(
            split_parent(&format!("/{}", "x".repeat(32))),
            Err(Error::InvalidName(_))
        ));
        assert!(split_parent(&format!("/{}", "x".repeat(31))).is_ok());
        assert!(matches!(validate_name("a\0b"), Err(Error::InvalidName(_))));
    }
}
