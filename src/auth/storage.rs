//! Atomic credential persistence.
//!
//! Credentials are rewritten in place on every refresh, and other processes
//! (the Gemini CLI itself) read the same files. Writes therefore go to a
//! sibling temp file that is renamed over the target, so a concurrent reader
//! sees either the old or the new credential, never a torn one.

use std::io::Write;
use std::path::Path;

use super::token::RawCredential;

/// Token files hold secrets: owner read/write only.
#[cfg(unix)]
const FILE_MODE: u32 = 0o600;

/// Parent directories likewise.
#[cfg(unix)]
const DIR_MODE: u32 = 0o700;

/// Write `credential` to `path` via temp-file-then-rename.
pub fn save_credential_atomic(path: &Path, credential: &RawCredential) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            std::fs::create_dir_all(dir)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(dir, std::fs::Permissions::from_mode(DIR_MODE))?;
            }
        }
    }

    let content = serde_json::to_string_pretty(credential)
        .map_err(|e| std::io::Error::other(format!("serialize credential: {e}")))?;

    let temp_path = path.with_extension("tmp");

    // Permissions are set at creation time so the secret is never readable
    // by other users, even transiently.
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(FILE_MODE);
    }

    let mut file = options.open(&temp_path)?;
    file.write_all(content.as_bytes())?;
    file.sync_all()?;
    drop(file);

    if let Err(e) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e);
    }
    Ok(())
}
