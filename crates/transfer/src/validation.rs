use std::path::{Component, Path};

use crate::TransferError;

/// Validates that a remote file name is a single normal path component.
///
/// The name is joined onto a local directory, so it must not be able to
/// escape it.
///
/// Rejects:
/// - Empty names
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Parent or current directory references (`..`, `.`)
/// - Names with more than one component (`a/b`)
pub fn validate_file_name(name: &str) -> Result<(), TransferError> {
    if name.trim().is_empty() {
        return Err(TransferError::InvalidName("empty name".into()));
    }

    let path = Path::new(name);
    if path.is_absolute() {
        return Err(TransferError::InvalidName(format!(
            "absolute path not allowed: {name}"
        )));
    }

    let mut components = path.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => {}
        (Some(Component::ParentDir), None) => {
            return Err(TransferError::InvalidName(format!(
                "parent directory reference not allowed: {name}"
            )));
        }
        (Some(Component::Prefix(_)), _) | (Some(Component::RootDir), _) => {
            return Err(TransferError::InvalidName(format!(
                "absolute path not allowed: {name}"
            )));
        }
        _ => {
            return Err(TransferError::InvalidName(format!(
                "name must be a single path component: {name}"
            )));
        }
    }

    if name.contains(['/', '\\']) {
        return Err(TransferError::InvalidName(format!(
            "path separator not allowed: {name}"
        )));
    }

    Ok(())
}
