//! Privilege switching
//!
//! Privileged scenarios (mounts, overlays) need the CLI to start as root.
//! The harness is expected to be launched through `sudo`: it drops to the
//! invoking user at suite start and keeps root in the saved uid, so each
//! privileged scenario can elevate for its own duration.
//!
//! Credentials are process-wide (glibc applies `setresuid` to every thread),
//! so the switcher serializes: an elevated scope holds an exclusive lock and
//! unprivileged scopes hold a shared one. Nothing unprivileged can spawn while
//! the process is elevated.

use std::io;

use nix::unistd::{setresgid, setresuid, Gid, Uid};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::common::{Error, Result};

use super::identity::Credentials;

/// Value meaning "leave this id unchanged" for setres*id
const UNCHANGED: u32 = u32::MAX;

fn set_uids(ruid: u32, euid: u32, suid: u32) -> io::Result<()> {
    setresuid(Uid::from_raw(ruid), Uid::from_raw(euid), Uid::from_raw(suid))?;
    Ok(())
}

fn set_gids(rgid: u32, egid: u32, sgid: u32) -> io::Result<()> {
    setresgid(Gid::from_raw(rgid), Gid::from_raw(egid), Gid::from_raw(sgid))?;
    Ok(())
}

/// Become root, keeping the previous ids in the saved slots where possible
fn elevate(from: &Credentials) -> io::Result<()> {
    set_uids(0, 0, UNCHANGED)?;
    if let Err(e) = set_gids(0, 0, UNCHANGED) {
        // leave the process exactly as we found it
        let _ = set_uids(from.ruid, from.euid, from.suid);
        return Err(e);
    }
    Ok(())
}

/// Return to `to`; gids first, while still root
fn restore(to: &Credentials) -> io::Result<()> {
    set_gids(to.rgid, to.egid, to.sgid)?;
    set_uids(to.ruid, to.euid, to.suid)
}

enum Hold<'a> {
    Shared(#[allow(dead_code)] RwLockReadGuard<'a, ()>),
    Exclusive(#[allow(dead_code)] RwLockWriteGuard<'a, ()>),
}

/// Scope of a privilege level; restores the previous credentials on drop
pub struct PrivilegeGuard<'a> {
    restore_to: Option<Credentials>,
    hold: Hold<'a>,
}

impl PrivilegeGuard<'_> {
    /// Whether this scope changed credentials
    pub fn is_elevated(&self) -> bool {
        self.restore_to.is_some()
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(self.hold, Hold::Exclusive(_))
    }
}

impl Drop for PrivilegeGuard<'_> {
    fn drop(&mut self) {
        let Some(to) = self.restore_to.take() else {
            return;
        };
        match restore(&to) {
            Ok(()) => tracing::debug!(uid = to.euid, "Privileges restored"),
            Err(e) => {
                // Carrying on as root would leak privilege into later scenarios
                tracing::error!(error = %e, "Failed to restore privileges, aborting");
                std::process::abort();
            }
        }
    }
}

/// Scoped elevation for privileged scenarios
pub struct PrivilegeSwitcher {
    lock: RwLock<()>,
    original: Credentials,
}

impl PrivilegeSwitcher {
    /// Capture the current credentials as the baseline
    pub fn new() -> Result<Self> {
        let original = Credentials::current()?;
        tracing::debug!(?original, "Privilege switcher baseline");
        Ok(Self {
            lock: RwLock::new(()),
            original,
        })
    }

    /// Credentials captured at construction
    pub fn original(&self) -> Credentials {
        self.original
    }

    /// Whether elevation can succeed at all
    pub fn can_elevate(&self) -> bool {
        self.original.can_become_root()
    }

    /// Enter a scope at the requested level
    ///
    /// `elevated = false` never touches credentials. Elevation failure is a
    /// setup error.
    pub async fn acquire(&self, elevated: bool) -> Result<PrivilegeGuard<'_>> {
        if !elevated {
            return Ok(PrivilegeGuard {
                restore_to: None,
                hold: Hold::Shared(self.lock.read().await),
            });
        }

        let hold = Hold::Exclusive(self.lock.write().await);
        let current = Credentials::current()?;
        if current.is_root() && current.ruid == 0 {
            return Ok(PrivilegeGuard {
                restore_to: None,
                hold,
            });
        }

        elevate(&current).map_err(|e| {
            Error::Privilege(format!(
                "cannot switch uid {} to root: {e} (run the suite through sudo for privileged scenarios)",
                current.euid
            ))
        })?;
        tracing::debug!(from_uid = current.euid, "Privileges elevated");

        Ok(PrivilegeGuard {
            restore_to: Some(current),
            hold,
        })
    }

    /// Drop from root to the user who invoked `sudo`
    ///
    /// Keeps root in the saved ids so later scopes can elevate. Returns the
    /// new credentials, or `None` when there is nothing to drop.
    pub fn drop_to_invoking_user() -> Result<Option<Credentials>> {
        Self::drop_to_invoking_user_with(|key| std::env::var(key).ok())
    }

    pub fn drop_to_invoking_user_with<F>(lookup: F) -> Result<Option<Credentials>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let current = Credentials::current()?;
        if !current.is_root() {
            return Ok(None);
        }
        let parse = |var: &str| -> Result<Option<u32>> {
            match lookup(var) {
                None => Ok(None),
                Some(v) => v
                    .trim()
                    .parse::<u32>()
                    .map(Some)
                    .map_err(|e| Error::env_invalid(var, &v, &e.to_string())),
            }
        };
        let (Some(uid), Some(gid)) = (parse("SUDO_UID")?, parse("SUDO_GID")?) else {
            return Ok(None);
        };
        if uid == 0 {
            return Ok(None);
        }

        set_gids(gid, gid, 0)
            .and_then(|_| set_uids(uid, uid, 0))
            .map_err(|e| Error::Privilege(format!("cannot drop to uid {uid}: {e}")))?;

        let dropped = Credentials::current()?;
        tracing::info!(uid, gid, "Dropped privileges to invoking user");
        Ok(Some(dropped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::process::{run_program, RunOptions};

    #[tokio::test]
    async fn test_unprivileged_scope_is_a_noop() {
        let switcher = PrivilegeSwitcher::new().unwrap();
        let before = Credentials::current().unwrap();
        let guard = switcher.acquire(false).await.unwrap();
        let value = Credentials::current().unwrap();
        drop(guard);
        let after = Credentials::current().unwrap();
        assert_eq!(before, value);
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_elevation_restores_or_fails_cleanly() {
        let switcher = PrivilegeSwitcher::new().unwrap();
        let before = Credentials::current().unwrap();

        let result = switcher.acquire(true).await;

        match result {
            Ok(guard) => {
                assert!(switcher.can_elevate());
                assert!(Credentials::current().unwrap().is_root());
                drop(guard);
            }
            Err(err) => {
                assert!(!switcher.can_elevate());
                assert!(matches!(err, Error::Privilege(_)));
                assert!(err.is_setup());
            }
        }
        assert_eq!(Credentials::current().unwrap(), before);
    }

    #[tokio::test]
    async fn test_shared_scopes_coexist() {
        let switcher = PrivilegeSwitcher::new().unwrap();
        let a = switcher.acquire(false).await.unwrap();
        let b = switcher.acquire(false).await.unwrap();
        assert!(!a.is_elevated() && !b.is_elevated());
        assert!(!a.is_exclusive());
    }

    #[tokio::test]
    async fn test_exclusive_scope_blocks_shared() {
        let switcher = PrivilegeSwitcher::new().unwrap();
        if !switcher.can_elevate() {
            return;
        }
        let guard = switcher.acquire(true).await.unwrap();
        assert!(guard.is_exclusive());
        let blocked =
            tokio::time::timeout(std::time::Duration::from_millis(50), switcher.acquire(false))
                .await;
        assert!(blocked.is_err());
        drop(guard);
        assert!(switcher.acquire(false).await.is_ok());
    }

    /// Set in the re-executed test binary that may change its own credentials
    const IN_CHILD: &str = "CONFORMANCE_PRIVILEGE_CHILD";

    /// Elevate from a dropped uid and check every way out of the scope
    ///
    /// Credentials are process-wide, so the body runs in a fresh copy of the
    /// test binary instead of next to the other tests.
    #[tokio::test]
    async fn test_elevate_and_restore_after_drop() {
        if std::env::var_os(IN_CHILD).is_some() {
            elevate_and_restore_body().await;
            return;
        }
        if !Credentials::current().unwrap().is_root() {
            eprintln!("SKIPPED: needs root");
            return;
        }
        let name = format!(
            "{}::test_elevate_and_restore_after_drop",
            module_path!().split_once("::").map_or("", |(_, rest)| rest)
        );
        let output = std::process::Command::new(std::env::current_exe().unwrap())
            .args([name.as_str(), "--exact", "--nocapture", "--test-threads=1"])
            .env(IN_CHILD, "1")
            .output()
            .unwrap();
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(
            output.status.success(),
            "stdout: {stdout}\nstderr: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        assert!(stdout.contains("1 passed"), "stdout: {stdout}");
    }

    async fn elevate_and_restore_body() {
        let dropped = PrivilegeSwitcher::drop_to_invoking_user_with(|key| match key {
            "SUDO_UID" | "SUDO_GID" => Some("65534".to_string()),
            _ => None,
        })
        .unwrap()
        .unwrap();
        assert_eq!((dropped.ruid, dropped.euid, dropped.suid), (65534, 65534, 0));
        assert_eq!((dropped.rgid, dropped.egid, dropped.sgid), (65534, 65534, 0));

        let switcher = PrivilegeSwitcher::new().unwrap();
        assert!(switcher.can_elevate());

        // normal exit, with a privileged child in between
        {
            let guard = switcher.acquire(true).await.unwrap();
            assert!(guard.is_elevated());
            assert!(Credentials::current().unwrap().is_root());
            let options = RunOptions {
                privileged: true,
                timeout: std::time::Duration::from_secs(10),
                ..RunOptions::default()
            };
            let result = run_program(
                std::path::Path::new("/bin/sh"),
                &["-c".to_string(), "id -u".to_string()],
                &options,
            )
            .await
            .unwrap();
            assert_eq!(result.stdout_lossy().trim(), "0");
        }
        assert_eq!(Credentials::current().unwrap(), dropped);

        // the scope body fails
        let failed: Result<()> = async {
            let _guard = switcher.acquire(true).await?;
            Err(Error::Internal("scope body failed".to_string()))
        }
        .await;
        assert!(failed.is_err());
        assert_eq!(Credentials::current().unwrap(), dropped);

        // the scope body panics
        let guard = switcher.acquire(true).await.unwrap();
        let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = guard;
            panic!("scope body panicked");
        }));
        assert!(panicked.is_err());
        assert_eq!(Credentials::current().unwrap(), dropped);

        // the switcher is still usable afterwards
        assert!(switcher.acquire(false).await.is_ok());
    }

    #[test]
    fn test_drop_without_sudo_vars_is_noop() {
        let before = Credentials::current().unwrap();
        let dropped = PrivilegeSwitcher::drop_to_invoking_user_with(|_| None).unwrap();
        assert!(dropped.is_none());
        assert_eq!(Credentials::current().unwrap(), before);
    }
}
