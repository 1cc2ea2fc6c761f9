//! Process identity and host facts
//!
//! Credentials of the harness process, the invoking user's passwd entry and
//! the host name. Scenario tables refer to these through `{user.name}`,
//! `{user.home}` and `{hostname}`.

use std::io;
use std::path::PathBuf;

use nix::unistd::{self, Uid, User};
use serde::Serialize;

use crate::common::{Error, Result};

/// Real, effective and saved user and group ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Credentials {
    pub ruid: u32,
    pub euid: u32,
    pub suid: u32,
    pub rgid: u32,
    pub egid: u32,
    pub sgid: u32,
}

impl Credentials {
    /// Read the credentials of the calling process
    pub fn current() -> io::Result<Self> {
        let uids = unistd::getresuid()?;
        let gids = unistd::getresgid()?;
        Ok(Self {
            ruid: uids.real.as_raw(),
            euid: uids.effective.as_raw(),
            suid: uids.saved.as_raw(),
            rgid: gids.real.as_raw(),
            egid: gids.effective.as_raw(),
            sgid: gids.saved.as_raw(),
        })
    }

    /// Effective root
    pub fn is_root(&self) -> bool {
        self.euid == 0
    }

    /// Whether any uid slot holds root, which allows switching to it
    pub fn can_become_root(&self) -> bool {
        self.ruid == 0 || self.euid == 0 || self.suid == 0
    }
}

/// Passwd entry of a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserInfo {
    pub uid: u32,
    pub name: String,
    pub home: PathBuf,
}

/// Passwd entry of the real (invoking) user
pub fn current_user() -> Result<UserInfo> {
    lookup_user(unistd::getuid().as_raw())
}

/// Look up a passwd entry by uid
pub fn lookup_user(uid: u32) -> Result<UserInfo> {
    let user = User::from_uid(Uid::from_raw(uid))
        .map_err(|e| Error::Config(format!("passwd lookup for uid {uid} failed: {e}")))?
        .ok_or_else(|| Error::Config(format!("no passwd entry for uid {uid}")))?;
    Ok(UserInfo {
        uid,
        name: user.name,
        home: user.dir,
    })
}

/// Host name as reported by the kernel
pub fn hostname() -> Result<String> {
    let name = unistd::gethostname().map_err(|e| Error::Io(e.into()))?;
    Ok(name.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_credentials() {
        let creds = Credentials::current().unwrap();
        assert_eq!(creds.ruid, unistd::getuid().as_raw());
        assert_eq!(creds.euid, unistd::geteuid().as_raw());
    }

    #[test]
    fn test_root_lookup() {
        // uid 0 has a passwd entry on every system the harness targets
        let root = lookup_user(0).unwrap();
        assert_eq!(root.uid, 0);
        assert_eq!(root.name, "root");
    }

    #[test]
    fn test_hostname_is_not_empty() {
        let name = hostname().unwrap();
        assert!(!name.is_empty());
        assert!(!name.contains('\0'));
    }
}
