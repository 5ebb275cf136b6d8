//! Device id resolution and token persistence.

use std::path::Path;

use tracing::{debug, info, warn};

use crate::AgentError;

/// Resolves the device id, persisting it to `id_file` for later runs.
///
/// Order: configured id, persisted id, `host-<hostname>`, random UUID.
pub fn resolve_device_id(configured: Option<&str>, id_file: &Path) -> Result<String, AgentError> {
    if let Some(id) = configured.map(str::trim).filter(|id| !id.is_empty()) {
        persist(id_file, id)?;
        return Ok(id.to_string());
    }

    if let Ok(saved) = std::fs::read_to_string(id_file) {
        let saved = saved.trim();
        if !saved.is_empty() {
            debug!(path = %id_file.display(), "using persisted device id");
            return Ok(saved.to_string());
        }
    }

    let id = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .map(|h| sanitize(&h))
        .filter(|h| !h.is_empty())
        .map(|h| format!("host-{h}"))
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    persist(id_file, &id)?;
    info!(device = %id, "generated device id");
    Ok(id)
}

/// Keeps characters the hub accepts in a storage directory name.
fn sanitize(host: &str) -> String {
    host.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

fn persist(path: &Path, value: &str) -> Result<(), AgentError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, value)?;
    Ok(())
}

/// Reads a previously stored token; a missing or empty file yields `None`.
pub fn load_token(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Ok(_) => None,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), "reading token file failed: {e}");
            }
            None
        }
    }
}

/// Stores the token, readable by the owner only.
pub fn save_token(path: &Path, token: &str) -> Result<(), AgentError> {
    persist(path, token)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    debug!(path = %path.display(), "token saved");
    Ok(())
}
