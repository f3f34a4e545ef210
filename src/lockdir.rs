/*
 * imapmirror - lock module.
 *
 * Copyright 2024 imapmirror developers
 *
 * This file is part of imapmirror.
 *
 * imapmirror is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * imapmirror is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with imapmirror. If not, see <http://www.gnu.org/licenses/>.
 */

/*! Cross-process mutual exclusion for the target directory.
 *
 * The token is a `lock/` subdirectory: `mkdir` is atomic on every platform
 * we care about, so whichever process creates it owns the directory until
 * it exits. The guard removes the token on drop.
 */

use std::{io, path::Path, path::PathBuf};

use crate::error::{Error, ErrorKind, Result};

#[derive(Debug)]
pub struct DirLock {
    path: PathBuf,
}

impl DirLock {
    pub fn acquire(directory: &Path) -> Result<Self> {
        let path = directory.join("lock");
        match std::fs::create_dir(&path) {
            Ok(()) => Ok(Self { path }),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Err(Error::new(format!(
                "{} exists; another instance is running (remove it if that instance crashed)",
                path.display()
            ))
            .set_kind(ErrorKind::Configuration)),
            Err(err) => Err(Error::from(err).set_kind(ErrorKind::Configuration)),
        }
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_dir(&self.path) {
            log::warn!("could not remove lock {}: {}", self.path.display(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_excludes_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        let lock = DirLock::acquire(dir.path()).unwrap();
        let err = DirLock::acquire(dir.path()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);
        drop(lock);
        // released on drop, a second acquisition succeeds
        let _lock = DirLock::acquire(dir.path()).unwrap();
    }
}
