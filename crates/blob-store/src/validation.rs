use std::path::{Component, Path};

use crate::StoreError;

/// Validates that a blob key cannot escape a directory-backed store root.
///
/// Rejects:
/// - Empty keys
/// - Absolute keys (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Keys that reach into the store's own staging area
pub fn validate_blob_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() {
        return Err(StoreError::InvalidUri("empty blob key".into()));
    }

    let path = Path::new(key);

    if path.is_absolute() {
        return Err(StoreError::InvalidUri(format!(
            "absolute blob key not allowed: {key}"
        )));
    }

    for (i, component) in path.components().enumerate() {
        match component {
            Component::ParentDir => {
                return Err(StoreError::InvalidUri(format!(
                    "parent directory traversal not allowed: {key}"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(StoreError::InvalidUri(format!(
                    "absolute blob key not allowed: {key}"
                )));
            }
            Component::Normal(name) if i == 0 && name == crate::dir::STAGING_DIR => {
                return Err(StoreError::InvalidUri(format!(
                    "reserved blob key: {key}"
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    Ok(())
}
