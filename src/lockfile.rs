//! Advisory HDB UUCP-style device lock: `<dir>/LCK..<device>`, holding
//! the owning pid as decimal text. Best-effort — failure to lock or
//! unlock is reported, never treated as fatal on its own, matching the
//! `--nolock` escape hatch.

use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use nix::libc;
use nix::sys::signal;
use nix::unistd::Pid;

static HELD_PATH: Mutex<Option<PathBuf>> = Mutex::new(None);

pub fn lockname(dir: &str, device: &Path) -> Option<PathBuf> {
    if dir.is_empty() || !Path::new(dir).is_dir() {
        return None;
    }
    let file = device.to_string_lossy();
    // Drop a leading "/dev/"-style prefix, then flatten remaining '/'s.
    let trimmed = file
        .strip_prefix('/')
        .and_then(|s| s.split_once('/'))
        .map(|(_, rest)| rest)
        .unwrap_or(&file);
    let flat = trimmed.replace('/', "_");
    Some(Path::new(dir).join(format!("LCK..{}", flat)))
}

/// Acquires the lock, reclaiming a stale one (owning pid no longer
/// alive) if found. Returns `Ok(None)` when locking was skipped
/// (`--nolock`, or no usable lock directory).
pub fn acquire(path: Option<PathBuf>) -> std::io::Result<Option<PathBuf>> {
    let path = match path {
        Some(p) => p,
        None => return Ok(None),
    };

    if let Ok(mut f) = fs::File::open(&path) {
        let mut buf = String::new();
        let _ = f.read_to_string(&mut buf);
        let pid: i32 = buf.trim().parse().unwrap_or(0);
        let stale = pid > 0
            && signal::kill(Pid::from_raw(pid), None).is_err()
            && std::io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH);
        if stale {
            std::thread::sleep(std::time::Duration::from_secs(1));
            let _ = fs::remove_file(&path);
        } else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("lock held: {}", path.display()),
            ));
        }
    }

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)?;
    file.set_permissions(fs::Permissions::from_mode(0o644))?;
    writeln!(file, "{:04}", std::process::id())?;

    *HELD_PATH.lock().unwrap() = Some(path.clone());
    Ok(Some(path))
}

pub fn release(path: &Option<PathBuf>) {
    if let Some(p) = path {
        let _ = fs::remove_file(p);
    }
    *HELD_PATH.lock().unwrap() = None;
}

/// Called from the deadly-signal handler; must not allocate or block
/// beyond what a signal handler may safely do. `unlink` itself is
/// async-signal-safe, so this is fine even mid-signal.
pub fn unlock_best_effort() {
    if let Ok(guard) = HELD_PATH.try_lock() {
        if let Some(p) = guard.as_ref() {
            let _ = fs::remove_file(p);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lockname_strips_dev_prefix_and_flattens_slashes() {
        let dir = tempfile::tempdir().unwrap();
        let got = lockname(dir.path().to_str().unwrap(), Path::new("/dev/pts/3")).unwrap();
        assert_eq!(got.file_name().unwrap().to_str().unwrap(), "LCK..pts_3");
    }

    #[test]
    fn lockname_none_for_missing_dir() {
        assert!(lockname("/no/such/dir", Path::new("/dev/ttyUSB0")).is_none());
    }

    #[test]
    fn acquire_then_release_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = lockname(dir.path().to_str().unwrap(), Path::new("/dev/ttyUSB0")).unwrap();
        let held = acquire(Some(path.clone())).unwrap();
        assert!(held.is_some());
        assert!(path.exists());
        release(&held);
        assert!(!path.exists());
    }

    #[test]
    fn acquire_rejects_a_lock_held_by_a_live_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = lockname(dir.path().to_str().unwrap(), Path::new("/dev/ttyUSB0")).unwrap();
        fs::write(&path, format!("{:04}\n", std::process::id())).unwrap();
        let err = acquire(Some(path)).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn acquire_reclaims_a_stale_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = lockname(dir.path().to_str().unwrap(), Path::new("/dev/ttyUSB0")).unwrap();
        // pid 0 is never a real process owner; kill(0, 0) targets the
        // caller's process group instead of failing with ESRCH, so use
        // a pid that is syntactically valid but essentially guaranteed
        // not to be running: std::process::id() + a large offset.
        let bogus_pid = std::process::id() as i32 + 1_000_000;
        fs::write(&path, format!("{:04}\n", bogus_pid)).unwrap();
        let held = acquire(Some(path.clone())).unwrap();
        assert!(held.is_some());
        release(&held);
    }
}
