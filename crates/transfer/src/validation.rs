use std::path::{Component, Path};

use crate::TransferError;

/// Checks that a name announced in `HEADER` is a plain file name.
///
/// Rejects:
/// - empty names and `.`/`..`
/// - path separators and absolute paths
/// - control characters, including the line terminators
pub fn sanitize_file_name(name: &str) -> Result<&str, TransferError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(TransferError::InvalidName("empty name".into()));
    }

    if name.chars().any(char::is_control) {
        return Err(TransferError::InvalidName(format!(
            "control character in name: {}",
            name.escape_default()
        )));
    }

    if name.contains(['/', '\\']) {
        return Err(TransferError::InvalidName(format!(
            "path separator not allowed: {name}"
        )));
    }

    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(name),
        _ => Err(TransferError::InvalidName(format!(
            "not a plain file name: {name}"
        ))),
    }
}
