//! # Storage Module - Named-Blob Persistence Layer
//!
//! All durable state is stored as small named binary blobs under one data
//! directory, with an optional mirror directory standing in for removable
//! media. Writes are atomic (temp file + rename) so a crash mid-write
//! leaves the previous good image in place.
//!
//! Blob names use the logical `/name` form (`/posts`, `/s_contacts`, ...);
//! the leading slash is stripped when mapping onto the filesystem.

pub mod identity;

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, warn};

/// Validation rule applied to a blob before trusting it.
///
/// A blob is usable when it meets the minimum size, its length is a
/// multiple of `size_alignment` (when non-zero), and its trailing four
/// bytes match `guard_tail` (when set).
#[derive(Clone, Copy, Debug, Default)]
pub struct BlobRule {
    pub min_size: usize,
    pub size_alignment: usize,
    pub guard_tail: Option<u32>,
}

impl BlobRule {
    pub fn min_size(min: usize) -> Self {
        Self {
            min_size: min,
            ..Default::default()
        }
    }

    pub fn aligned(alignment: usize) -> Self {
        Self {
            size_alignment: alignment,
            ..Default::default()
        }
    }

    pub fn guarded(min: usize, guard: u32) -> Self {
        Self {
            min_size: min,
            size_alignment: 0,
            guard_tail: Some(guard),
        }
    }

    fn accepts(&self, bytes: &[u8]) -> bool {
        if bytes.len() < self.min_size {
            return false;
        }
        if self.size_alignment > 0 && bytes.len() % self.size_alignment != 0 {
            return false;
        }
        if let Some(guard) = self.guard_tail {
            if bytes.len() < 4 {
                return false;
            }
            let tail = &bytes[bytes.len() - 4..];
            if u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]) != guard {
                return false;
            }
        }
        true
    }
}

/// Named-blob store with atomic overwrite and an optional mirror sink.
pub struct BlobStore {
    root: PathBuf,
    mirror: Option<PathBuf>,
}

impl BlobStore {
    /// Open (creating as needed) a store rooted at `root`, with an optional
    /// mirror directory.
    pub fn open(root: impl Into<PathBuf>, mirror: Option<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("creating data dir {}", root.display()))?;
        if let Some(ref m) = mirror {
            if let Err(e) = fs::create_dir_all(m) {
                warn!("mirror dir {} unavailable: {}", m.display(), e);
            }
        }
        Ok(Self { root, mirror })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name.trim_start_matches('/'))
    }

    fn mirror_path_for(&self, name: &str) -> Option<PathBuf> {
        self.mirror
            .as_ref()
            .map(|m| m.join(name.trim_start_matches('/')))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path_for(name).exists()
    }

    pub fn read_all(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.path_for(name);
        fs::read(&path).with_context(|| format!("reading blob {}", path.display()))
    }

    /// Atomic overwrite: write a temp file in the same directory, fsync,
    /// then rename over the destination.
    pub fn write_all(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(name);
        atomic_write(&path, bytes)
    }

    pub fn append(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(name);
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {} for append", path.display()))?;
        f.write_all(bytes)?;
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        let path = self.path_for(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
        }
    }

    /// Copy the primary blob to the mirror. A missing mirror or missing
    /// primary is not an error; callers treat the mirror as best-effort.
    pub fn backup(&self, name: &str) {
        let Some(dst) = self.mirror_path_for(name) else {
            return;
        };
        let src = self.path_for(name);
        if !src.exists() {
            return;
        }
        if let Err(e) = fs::copy(&src, &dst) {
            warn!("backup of {name} failed: {e}");
        } else {
            debug!("backed up {name} to mirror");
        }
    }

    /// Copy the mirror blob back over the primary. Returns true when a copy
    /// was restored.
    pub fn restore(&self, name: &str) -> bool {
        let Some(src) = self.mirror_path_for(name) else {
            return false;
        };
        if !src.exists() {
            return false;
        }
        match fs::read(&src).and_then(|bytes| {
            atomic_write(&self.path_for(name), &bytes)
                .map_err(|e| std::io::Error::other(e.to_string()))
        }) {
            Ok(()) => {
                debug!("restored {name} from mirror");
                true
            }
            Err(e) => {
                warn!("restore of {name} failed: {e}");
                false
            }
        }
    }

    /// Check the primary blob against `rule`; when it is absent or fails
    /// validation, pull the mirror copy back (which must itself pass the
    /// rule to be trusted).
    pub fn restore_if_invalid(&self, name: &str, rule: &BlobRule) {
        if self.blob_usable(name, rule) {
            return;
        }
        if self.restore(name) && !self.blob_usable(name, rule) {
            warn!("mirror copy of {name} also fails validation");
        }
    }

    fn blob_usable(&self, name: &str, rule: &BlobRule) -> bool {
        match self.read_all(name) {
            Ok(bytes) => rule.accepts(&bytes),
            Err(_) => false,
        }
    }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let base = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("blob");
    let tmp_path = dir.join(format!(".{}.tmp-{}", base, std::process::id()));
    {
        let mut tmp = File::create(&tmp_path)
            .with_context(|| format!("creating temp file for {}", path.display()))?;
        tmp.write_all(bytes)?;
        tmp.flush()?;
        let _ = tmp.sync_all();
    }
    fs::rename(&tmp_path, path)
        .with_context(|| format!("renaming temp file onto {}", path.display()))?;
    Ok(())
}
