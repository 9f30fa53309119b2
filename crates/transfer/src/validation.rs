use crate::TransferError;

/// Longest key object stores accept.
const MAX_KEY_LEN: usize = 1024;

/// Validates a destination object key before any storage call is made.
///
/// Rejects:
/// - Empty keys and keys longer than 1024 bytes
/// - Leading `/`
/// - Empty segments (`a//b`) and a trailing `/`
/// - `.` and `..` segments
/// - Control characters
pub fn validate_object_key(key: &str) -> Result<(), TransferError> {
    if key.is_empty() {
        return Err(TransferError::InvalidPath("empty key".into()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(TransferError::InvalidPath(format!(
            "key longer than {MAX_KEY_LEN} bytes"
        )));
    }
    if key.starts_with('/') {
        return Err(TransferError::InvalidPath(format!(
            "leading slash not allowed: {key}"
        )));
    }
    if key.chars().any(char::is_control) {
        return Err(TransferError::InvalidPath(format!(
            "control character in key: {key:?}"
        )));
    }

    for segment in key.split('/') {
        match segment {
            "" => {
                return Err(TransferError::InvalidPath(format!(
                    "empty path segment: {key}"
                )));
            }
            "." | ".." => {
                return Err(TransferError::InvalidPath(format!(
                    "relative path segment not allowed: {key}"
                )));
            }
            _ => {}
        }
    }

    Ok(())
}
