//! Database configuration (§6, §10.3): the knobs an operator sets on open,
//! plus the `P.info` file written (not read back) so the on-disk layout is
//! self-describing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fathom_common::{DurabilityMode, LockMode, LockTimeout, DEFAULT_PAGE_SIZE};

/// Configuration for opening a [`crate::Database`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Base path; the data file lives at `{base_path}.db`, the redo
    /// directory at `{base_path}.redo/`, etc. (§6 file layout).
    pub base_path: PathBuf,
    pub page_size: usize,
    /// Node cache capacity, in resident pages.
    pub cache_capacity: usize,
    /// How often the background checkpointer wakes to consider a flush.
    pub checkpoint_interval: Duration,
    pub durability_mode: DurabilityMode,
    pub lock_mode: LockMode,
    pub lock_timeout_nanos: i64,
    /// Values larger than this many bytes are rejected with `LargeValue`.
    pub max_value_size: usize,
}

impl DatabaseConfig {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            page_size: DEFAULT_PAGE_SIZE,
            cache_capacity: 1024,
            checkpoint_interval: Duration::from_secs(5),
            durability_mode: DurabilityMode::default(),
            lock_mode: LockMode::default(),
            lock_timeout_nanos: LockTimeout::default().0,
            max_value_size: 1 << 20,
        }
    }

    pub fn data_path(&self) -> PathBuf {
        path_with_suffix(&self.base_path, ".db")
    }

    pub fn info_path(&self) -> PathBuf {
        path_with_suffix(&self.base_path, ".info")
    }

    pub fn lock_path(&self) -> PathBuf {
        path_with_suffix(&self.base_path, ".lock")
    }

    pub fn redo_dir(&self) -> PathBuf {
        path_with_suffix(&self.base_path, ".redo")
    }

    pub fn redo_base_name(&self) -> &str {
        "r"
    }

    pub fn temp_path(&self, number: u64) -> PathBuf {
        path_with_suffix(&self.base_path, &format!(".temp.{number}"))
    }

    pub fn lock_timeout(&self) -> LockTimeout {
        LockTimeout(self.lock_timeout_nanos)
    }

    /// Write the human-readable `P.info` file. Never read back by the
    /// engine itself — purely an operator-facing description of how the
    /// data file was opened.
    pub fn write_info_file(&self) -> fathom_common::Result<()> {
        let text = toml::to_string_pretty(self)
            .map_err(|e| fathom_common::Error::CorruptDatabase(format!("failed to encode P.info: {e}")))?;
        std::fs::write(self.info_path(), text)?;
        Ok(())
    }
}

fn path_with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut os = base.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_paths_append_suffix_to_base() {
        let cfg = DatabaseConfig::new("/tmp/mydb");
        assert_eq!(cfg.data_path(), PathBuf::from("/tmp/mydb.db"));
        assert_eq!(cfg.info_path(), PathBuf::from("/tmp/mydb.info"));
        assert_eq!(cfg.lock_path(), PathBuf::from("/tmp/mydb.lock"));
        assert_eq!(cfg.redo_dir(), PathBuf::from("/tmp/mydb.redo"));
    }

    #[test]
    fn info_file_round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = DatabaseConfig::new(dir.path().join("t"));
        cfg.write_info_file().unwrap();
        let text = std::fs::read_to_string(cfg.info_path()).unwrap();
        let parsed: DatabaseConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.page_size, cfg.page_size);
    }
}
