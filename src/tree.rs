//! Working tree access: content fingerprints and the atomic multi-file commit.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{DevloopError, Result};

/// Content identity of a file at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub sha256: String,
    pub len: u64,
}

impl Fingerprint {
    pub fn of(bytes: &[u8]) -> Self {
        Self {
            sha256: hex::encode(Sha256::digest(bytes)),
            len: bytes.len() as u64,
        }
    }
}

/// Read-only view the validator uses to check file existence.
pub trait RepoOracle {
    /// `None` when the path does not exist.
    fn fingerprint(&self, path: &str) -> Result<Option<Fingerprint>>;
}

/// One file-level effect of a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingWrite {
    Write { path: String, content: String },
    Remove { path: String },
}

impl PendingWrite {
    pub fn path(&self) -> &str {
        match self {
            PendingWrite::Write { path, .. } | PendingWrite::Remove { path } => path,
        }
    }
}

/// A checkout rooted at `root`. All paths are repo-relative.
#[derive(Debug, Clone)]
pub struct WorkingTree {
    root: PathBuf,
}

impl WorkingTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    /// Raw bytes, `None` when absent.
    pub fn read_bytes(&self, path: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.resolve(path)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// UTF-8 text, `None` when absent.
    pub fn read_text(&self, path: &str) -> Result<Option<String>> {
        match self.read_bytes(path)? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| DevloopError::Patch(format!("{} is not valid UTF-8 text", path))),
            None => Ok(None),
        }
    }

    /// Apply every write, or none of them.
    ///
    /// New contents are staged into sibling temp files first; a staging
    /// failure leaves the tree untouched. Renames into place follow, removals
    /// go last, and a failure in that phase restores the pre-images of
    /// everything already committed.
    pub fn commit(&self, writes: &[PendingWrite]) -> Result<()> {
        let mut staged: Vec<(PathBuf, PathBuf)> = Vec::new();
        let mut created_dirs: Vec<PathBuf> = Vec::new();

        for write in writes {
            if let PendingWrite::Write { path, content } = write {
                match self.stage(path, content, &mut created_dirs) {
                    Ok(pair) => staged.push(pair),
                    Err(e) => {
                        discard_staged(&staged, &created_dirs);
                        return Err(e);
                    }
                }
            }
        }

        // pre-images for rollback, read before anything moves
        let mut pre_images: Vec<(PathBuf, Option<Vec<u8>>)> = Vec::new();
        for write in writes {
            let target = self.resolve(write.path());
            let pre = match fs::read(&target) {
                Ok(bytes) => Some(bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => {
                    discard_staged(&staged, &created_dirs);
                    return Err(e.into());
                }
            };
            pre_images.push((target, pre));
        }

        let mut committed: Vec<usize> = Vec::new();
        let mut staged_iter = staged.iter();
        let ordered = writes
            .iter()
            .enumerate()
            .filter(|(_, w)| matches!(w, PendingWrite::Write { .. }))
            .chain(
                writes
                    .iter()
                    .enumerate()
                    .filter(|(_, w)| matches!(w, PendingWrite::Remove { .. })),
            );

        for (idx, write) in ordered {
            let result = match write {
                PendingWrite::Write { .. } => match staged_iter.next() {
                    Some((tmp, target)) => fs::rename(tmp, target),
                    None => Err(std::io::Error::other("staged file missing")),
                },
                PendingWrite::Remove { path } => {
                    let target = self.resolve(path);
                    fs::remove_file(&target).map(|_| self.prune_empty_dirs(&target))
                }
            };

            if let Err(e) = result {
                warn!("commit: {} failed: {}; rolling back", write.path(), e);
                rollback(&committed, &pre_images);
                let remaining: Vec<(PathBuf, PathBuf)> = staged_iter.cloned().collect();
                discard_staged(&remaining, &[]);
                return Err(e.into());
            }
            committed.push(idx);
        }

        debug!("commit: {} file(s) written under {}", writes.len(), self.root.display());
        Ok(())
    }

    fn stage(&self, path: &str, content: &str, created_dirs: &mut Vec<PathBuf>) -> Result<(PathBuf, PathBuf)> {
        let target = self.resolve(path);
        let parent = target
            .parent()
            .ok_or_else(|| DevloopError::Patch(format!("{} has no parent directory", path)))?
            .to_path_buf();

        if !parent.exists() {
            let mut topmost = parent.clone();
            while let Some(up) = topmost.parent() {
                if up.exists() {
                    break;
                }
                topmost = up.to_path_buf();
            }
            fs::create_dir_all(&parent)?;
            created_dirs.push(topmost);
        }

        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = parent.join(format!(".{}.devloop-{}.tmp", file_name, std::process::id()));

        let mut file = fs::OpenOptions::new().write(true).create_new(true).open(&tmp)?;
        let written = file.write_all(content.as_bytes()).and_then(|_| file.sync_all());
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        if let Ok(meta) = fs::metadata(&target)
            && let Err(e) = fs::set_permissions(&tmp, meta.permissions())
        {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        Ok((tmp, target))
    }

    /// Remove directories left empty by a delete, up to the root.
    fn prune_empty_dirs(&self, removed: &Path) {
        let mut dir = removed.parent();
        while let Some(d) = dir {
            if d == self.root || !d.starts_with(&self.root) {
                break;
            }
            if fs::remove_dir(d).is_err() {
                break;
            }
            dir = d.parent();
        }
    }
}

impl RepoOracle for WorkingTree {
    fn fingerprint(&self, path: &str) -> Result<Option<Fingerprint>> {
        Ok(self.read_bytes(path)?.map(|bytes| Fingerprint::of(&bytes)))
    }
}

fn discard_staged(staged: &[(PathBuf, PathBuf)], created_dirs: &[PathBuf]) {
    for (tmp, _) in staged {
        if let Err(e) = fs::remove_file(tmp) {
            warn!("failed to remove staged file {}: {}", tmp.display(), e);
        }
    }
    for dir in created_dirs {
        let _ = fs::remove_dir_all(dir);
    }
}

fn rollback(committed: &[usize], pre_images: &[(PathBuf, Option<Vec<u8>>)]) {
    for idx in committed.iter().rev() {
        let (target, pre) = &pre_images[*idx];
        let restored = match pre {
            Some(bytes) => {
                if let Some(parent) = target.parent() {
                    let _ = fs::create_dir_all(parent);
                }
                fs::write(target, bytes)
            }
            None => fs::remove_file(target),
        };
        if let Err(e) = restored {
            warn!("rollback of {} failed: {}", target.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tree() -> (TempDir, WorkingTree) {
        let dir = TempDir::new().unwrap();
        let tree = WorkingTree::new(dir.path());
        (dir, tree)
    }

    #[test]
    fn test_fingerprint_absent_and_present() {
        let (dir, tree) = tree();
        assert_eq!(tree.fingerprint("missing.txt").unwrap(), None);

        fs::write(dir.path().join("a.txt"), "abc").unwrap();
        let fp = tree.fingerprint("a.txt").unwrap().unwrap();
        assert_eq!(fp.len, 3);
        assert_eq!(fp.sha256, "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
    }

    #[test]
    fn test_commit_writes_and_removes() {
        let (dir, tree) = tree();
        fs::write(dir.path().join("keep.txt"), "old\n").unwrap();
        fs::create_dir_all(dir.path().join("gone")).unwrap();
        fs::write(dir.path().join("gone/file.txt"), "bye\n").unwrap();

        tree.commit(&[
            PendingWrite::Write {
                path: "keep.txt".to_string(),
                content: "new\n".to_string(),
            },
            PendingWrite::Write {
                path: "nested/dir/created.txt".to_string(),
                content: "hi".to_string(),
            },
            PendingWrite::Remove {
                path: "gone/file.txt".to_string(),
            },
        ])
        .unwrap();

        assert_eq!(fs::read_to_string(dir.path().join("keep.txt")).unwrap(), "new\n");
        assert_eq!(fs::read_to_string(dir.path().join("nested/dir/created.txt")).unwrap(), "hi");
        assert!(!dir.path().join("gone").exists());

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_commit_rolls_back_on_failed_remove() {
        let (dir, tree) = tree();
        fs::write(dir.path().join("a.txt"), "before\n").unwrap();

        let result = tree.commit(&[
            PendingWrite::Write {
                path: "a.txt".to_string(),
                content: "after\n".to_string(),
            },
            PendingWrite::Remove {
                path: "does-not-exist.txt".to_string(),
            },
        ]);

        assert!(result.is_err());
        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), "before\n");
    }

    #[test]
    fn test_read_text_rejects_non_utf8() {
        let (dir, tree) = tree();
        fs::write(dir.path().join("bin.dat"), [0xff, 0xfe, 0x00]).unwrap();
        assert!(tree.read_text("bin.dat").is_err());
        assert_eq!(tree.read_text("nope").unwrap(), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_commit_preserves_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let (dir, tree) = tree();
        let script = dir.path().join("run.sh");
        fs::write(&script, "echo a\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        tree.commit(&[PendingWrite::Write {
            path: "run.sh".to_string(),
            content: "echo b\n".to_string(),
        }])
        .unwrap();

        let mode = fs::metadata(&script).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}
