use crate::TransferError;

/// Reduces a client-supplied file name to its final path component.
///
/// Both `/` and `\` count as separators so a Windows agent cannot smuggle
/// a path into the storage directory.
pub fn sanitize_file_name(name: &str) -> Result<String, TransferError> {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if base.is_empty() || base == "." || base == ".." {
        return Err(TransferError::InvalidPath(format!("invalid file name: {name:?}")));
    }
    if base.contains('\0') {
        return Err(TransferError::InvalidPath("file name contains NUL".into()));
    }
    Ok(base.to_string())
}

/// Validates a device id for use as a storage directory name.
pub fn validate_device_id(device_id: &str) -> Result<(), TransferError> {
    if device_id.is_empty() {
        return Err(TransferError::InvalidRequest("missing device id".into()));
    }
    if device_id == "."
        || device_id == ".."
        || device_id.contains(['/', '\\', '\0'])
    {
        return Err(TransferError::InvalidPath(format!(
            "invalid device id: {device_id:?}"
        )));
    }
    Ok(())
}
