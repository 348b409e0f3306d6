//! Stable instance identity for run ownership.
//!
//! The ownership token combines a SHA-256 machine fingerprint with a
//! per-process launch UUID. Runs are stamped with the token of the process
//! that launched them; at startup any non-terminal run carrying a *different*
//! token belonged to a dead process and is reconciled as orphaned.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Builds the ownership token for this process: `{fingerprint}:{launch-uuid}`.
///
/// The fingerprint half is stable across restarts on the same machine; the
/// UUID half is unique per process so two consecutive starts of the daemon on
/// the same host never share a token.
pub fn ownership_token() -> String {
    let fingerprint = hex_sha256(&machine_id());
    format!("{}:{}", &fingerprint[..16], Uuid::new_v4())
}

/// Returns a raw platform identifier string, falling back to hostname-ish
/// environment data when no machine id is available.
fn machine_id() -> String {
    #[cfg(target_os = "linux")]
    {
        for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
            if let Ok(id) = std::fs::read_to_string(path) {
                let id = id.trim();
                if !id.is_empty() {
                    return id.to_string();
                }
            }
        }
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(out) = std::process::Command::new("ioreg")
            .args(["-rd1", "-c", "IOPlatformExpertDevice"])
            .output()
        {
            let stdout = String::from_utf8_lossy(&out.stdout);
            for line in stdout.lines() {
                if line.contains("IOPlatformUUID") {
                    if let Some(uuid) = line.split('"').nth(3) {
                        return uuid.to_string();
                    }
                }
            }
        }
    }

    // Fallback: not stable across environments, but still unique enough to
    // distinguish hosts in practice.
    format!(
        "{}|{}",
        std::env::var("HOSTNAME").unwrap_or_default(),
        std::env::var("HOME").unwrap_or_default()
    )
}

fn hex_sha256(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}
