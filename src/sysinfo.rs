//! Narrow environment/system-info provider.
//!
//! Full system telemetry collection is out of scope; this crate only needs a
//! hostname and a stable machine UUID to tag `LogGroup`s (see aggregator
//! §4.4). The UUID is generated once and persisted next to the checkpoint
//! file so it survives restarts.

use std::io;
use std::path::Path;
use uuid::Uuid;

pub fn hostname() -> String {
    #[cfg(unix)]
    {
        if let Ok(name) = std::env::var("HOSTNAME") {
            if !name.is_empty() {
                return name;
            }
        }
        hostname_via_uname().unwrap_or_else(|_| "unknown-host".to_string())
    }
    #[cfg(not(unix))]
    {
        std::env::var("COMPUTERNAME").unwrap_or_else(|_| "unknown-host".to_string())
    }
}

#[cfg(unix)]
fn hostname_via_uname() -> io::Result<String> {
    // Avoid a libc dependency for one syscall: read the kernel-exposed name.
    std::fs::read_to_string("/proc/sys/kernel/hostname").map(|s| s.trim().to_string())
}

/// Load the persisted machine UUID, generating and persisting a fresh one on
/// first run. Idempotent across restarts.
pub fn machine_uuid(state_dir: &Path) -> io::Result<String> {
    let uuid_path = state_dir.join("machine.uuid");
    if let Ok(existing) = std::fs::read_to_string(&uuid_path) {
        let trimmed = existing.trim();
        if Uuid::parse_str(trimmed).is_ok() {
            return Ok(trimmed.to_string());
        }
    }
    let fresh = Uuid::new_v4().to_string();
    if let Some(parent) = uuid_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&uuid_path, &fresh)?;
    Ok(fresh)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_uuid_is_stable_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let first = machine_uuid(dir.path()).unwrap();
        let second = machine_uuid(dir.path()).unwrap();
        assert_eq!(first, second);
        assert!(Uuid::parse_str(&first).is_ok());
    }
}
