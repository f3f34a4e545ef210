/*
 * imapmirror - state module.
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

/*! Durable UID checkpoint.
 *
 * `lastuid` holds the UID of the most recent message that was fully handed
 * to the sink, as decimal ASCII plus newline. Updates go through
 * `lastuid.new` followed by a rename, so a crash leaves either the old or
 * the new value on disk, never a torn write. A missing or unparsable file
 * reads as 0, which means "mirror everything".
 */

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use crate::error::{Result, ResultIntoError};

pub const LASTUID_FILE: &str = "lastuid";
pub const LASTUID_TMP_FILE: &str = "lastuid.new";

#[derive(Debug)]
pub struct UidCheckpoint {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl UidCheckpoint {
    pub fn new(directory: &Path) -> Self {
        Self {
            path: directory.join(LASTUID_FILE),
            tmp_path: directory.join(LASTUID_TMP_FILE),
        }
    }

    pub fn load(&self) -> u64 {
        match fs::read_to_string(&self.path) {
            Ok(contents) => match contents.trim().parse::<u64>() {
                Ok(uid) => uid,
                Err(_) => {
                    log::warn!(
                        "{} does not contain a UID ({:?}), starting from scratch",
                        self.path.display(),
                        contents.trim()
                    );
                    0
                }
            },
            Err(_) => 0,
        }
    }

    /// Persist `uid` atomically. Only call after the sink has accepted the
    /// corresponding message.
    pub fn store(&self, uid: u64) -> Result<()> {
        let mut file = fs::File::create(&self.tmp_path)
            .chain_err_summary(|| format!("Could not create {}", self.tmp_path.display()))?;
        file.write_all(format!("{}\n", uid).as_bytes())?;
        file.sync_all()?;
        fs::rename(&self.tmp_path, &self.path)
            .chain_err_summary(|| format!("Could not rename over {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = UidCheckpoint::new(dir.path());
        assert_eq!(ckpt.load(), 0);
        ckpt.store(42).unwrap();
        assert_eq!(ckpt.load(), 42);
        assert_eq!(fs::read(dir.path().join(LASTUID_FILE)).unwrap(), b"42\n");
        // the rename source must not linger
        assert!(!dir.path().join(LASTUID_TMP_FILE).exists());
        ckpt.store(43).unwrap();
        assert_eq!(ckpt.load(), 43);
    }

    #[test]
    fn test_checkpoint_tolerates_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = UidCheckpoint::new(dir.path());
        fs::write(dir.path().join(LASTUID_FILE), "foo\n").unwrap();
        assert_eq!(ckpt.load(), 0);
        fs::write(dir.path().join(LASTUID_FILE), "  17 \n\n").unwrap();
        assert_eq!(ckpt.load(), 17);
        fs::write(dir.path().join(LASTUID_FILE), "-3\n").unwrap();
        assert_eq!(ckpt.load(), 0);
    }

    #[test]
    fn test_checkpoint_stale_tmp_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = UidCheckpoint::new(dir.path());
        // a crash between write and rename leaves lastuid.new behind
        fs::write(dir.path().join(LASTUID_TMP_FILE), "99\n").unwrap();
        assert_eq!(ckpt.load(), 0);
        ckpt.store(100).unwrap();
        assert_eq!(ckpt.load(), 100);
    }
}
