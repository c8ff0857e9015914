// SPDX-License-Identifier: Apache-2.0
//! Persistent Lease Store Adapter (spec §4.1, §6).
//!
//! Models the external durable key-value store as a thin wrapper over a
//! single on-disk file holding one logical key,
//! `("SEQUENCER", "CURRENT") -> i64`. A real deployment swaps this for a
//! client of the shared layout/membership store; `LeaseStore` is the
//! seam where that swap happens.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::StorageError;

/// Durable single-key store for the lease boundary `L`.
pub trait LeaseStore: Send + Sync {
    /// Returns the last durably written lease start, or `None` on first boot.
    fn read_lease(&self) -> Result<Option<i64>, StorageError>;

    /// Durably persists `pos` as the new lease start. Does not return
    /// until the write has reached disk.
    fn write_lease(&self, pos: i64) -> Result<(), StorageError>;
}

/// File-backed `LeaseStore`. Each write is a create-temp-write-fsync-
/// rename, so a crash mid-write never leaves a partially written value
/// behind for the next boot to read.
pub struct FileLeaseStore {
    path: PathBuf,
}

impl FileLeaseStore {
    pub fn new(dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        Ok(Self { path: dir.join("sequencer.lease") })
    }

    fn tmp_path(&self) -> PathBuf {
        let mut p = self.path.clone();
        p.set_extension("lease.tmp");
        p
    }
}

impl LeaseStore for FileLeaseStore {
    fn read_lease(&self) -> Result<Option<i64>, StorageError> {
        match File::open(&self.path) {
            Ok(mut f) => {
                let mut buf = [0u8; 8];
                f.read_exact(&mut buf)?;
                Ok(Some(i64::from_le_bytes(buf)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_lease(&self, pos: i64) -> Result<(), StorageError> {
        let tmp = self.tmp_path();
        {
            let mut f = File::create(&tmp)?;
            f.write_all(&pos.to_le_bytes())?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        // fsync the containing directory so the rename itself is durable.
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        File::open(dir)?.sync_all()?;
        Ok(())
    }
}

/// In-memory `LeaseStore` used by tests and by the allocator's own unit
/// tests; never durable across process restarts by design.
#[derive(Default)]
pub struct InMemoryLeaseStore {
    value: parking_lot::Mutex<Option<i64>>,
}

impl LeaseStore for InMemoryLeaseStore {
    fn read_lease(&self) -> Result<Option<i64>, StorageError> {
        Ok(*self.value.lock())
    }

    fn write_lease(&self, pos: i64) -> Result<(), StorageError> {
        *self.value.lock() = Some(pos);
        Ok(())
    }
}
