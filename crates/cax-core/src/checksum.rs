// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Content hashing for files and directories.
//!
//! The master-checksum comparison in the verification task only works if
//! every host computes the same hash for identical bytes, so directory
//! hashing walks entries in sorted relative-path order and mixes each
//! file's path into the digest alongside its content.

use std::io::Read;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha512};

use crate::error::CaxError;

/// Computes a content hash for a path.
#[async_trait]
pub trait ChecksumProvider: Send + Sync {
    /// Hash the file or directory at `path`, returning a lowercase hex digest.
    async fn hash(&self, path: &Path) -> Result<String, CaxError>;
}

/// SHA-512 based checksum provider.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha512Checksum;

#[async_trait]
impl ChecksumProvider for Sha512Checksum {
    async fn hash(&self, path: &Path) -> Result<String, CaxError> {
        let path = path.to_path_buf();
        let display = path.display().to_string();
        tokio::task::spawn_blocking(move || hash_path(&path))
            .await
            .map_err(|e| CaxError::Io {
                path: display.clone(),
                details: format!("hash task panicked: {}", e),
            })?
            .map_err(|e| CaxError::Io {
                path: display,
                details: e.to_string(),
            })
    }
}

fn hash_path(path: &Path) -> std::io::Result<String> {
    let mut hasher = Sha512::new();
    if path.is_dir() {
        for relative in sorted_files(path)? {
            hasher.update(relative.to_string_lossy().as_bytes());
            hasher.update([0u8]);
            hash_file_into(&path.join(&relative), &mut hasher)?;
        }
    } else {
        hash_file_into(path, &mut hasher)?;
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn hash_file_into(path: &Path, hasher: &mut Sha512) -> std::io::Result<()> {
    let mut file = std::fs::File::open(path)?;
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(())
}

/// All regular files under `root`, as paths relative to it, sorted.
fn sorted_files(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else if let Ok(relative) = path.strip_prefix(root) {
                files.push(relative.to_path_buf());
            }
        }
    }
    files.sort();
    Ok(files)
}
