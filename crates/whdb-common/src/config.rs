//! Configuration structures for whdb.

use crate::error::{Result, WhdbError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Storage configuration for the database core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for data files.
    pub data_dir: PathBuf,
    /// File name of the index block file, relative to `data_dir`.
    pub index_file: String,
    /// File name of the transaction commit bitmap, relative to `data_dir`.
    pub transaction_file: String,
    /// Enable fsync for durability.
    pub fsync_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            index_file: "index.whdb".to_string(),
            transaction_file: "translog.whdb".to_string(),
            fsync_enabled: true,
        }
    }
}

impl StorageConfig {
    /// Returns the full path of the index block file.
    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join(&self.index_file)
    }

    /// Returns the full path of the transaction commit bitmap.
    pub fn transaction_path(&self) -> PathBuf {
        self.data_dir.join(&self.transaction_file)
    }

    /// Checks that the configured file names are usable.
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(WhdbError::ConfigError("data_dir is empty".to_string()));
        }
        for (name, value) in [
            ("index_file", &self.index_file),
            ("transaction_file", &self.transaction_file),
        ] {
            if value.is_empty() || value.contains(['/', '\\']) {
                return Err(WhdbError::InvalidParameter {
                    name: name.to_string(),
                    value: value.clone(),
                });
            }
        }
        if self.index_file == self.transaction_file {
            return Err(WhdbError::ConfigError(
                "index_file and transaction_file must differ".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_config_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.index_file, "index.whdb");
        assert_eq!(config.transaction_file, "translog.whdb");
        assert!(config.fsync_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_storage_config_paths() {
        let config = StorageConfig {
            data_dir: PathBuf::from("/var/lib/whdb"),
            ..Default::default()
        };
        assert_eq!(config.index_path(), PathBuf::from("/var/lib/whdb/index.whdb"));
        assert_eq!(
            config.transaction_path(),
            PathBuf::from("/var/lib/whdb/translog.whdb")
        );
    }

    #[test]
    fn test_storage_config_rejects_empty_data_dir() {
        let config = StorageConfig {
            data_dir: PathBuf::new(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(WhdbError::ConfigError(_))));
    }

    #[test]
    fn test_storage_config_rejects_bad_file_names() {
        let config = StorageConfig {
            index_file: "sub/index.whdb".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(WhdbError::InvalidParameter { .. })
        ));

        let config = StorageConfig {
            transaction_file: String::new(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(WhdbError::InvalidParameter { .. })
        ));

        let config = StorageConfig {
            transaction_file: "index.whdb".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(WhdbError::ConfigError(_))));
    }

    #[test]
    fn test_storage_config_serde_roundtrip() {
        let original = StorageConfig {
            fsync_enabled: false,
            ..Default::default()
        };
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: StorageConfig = serde_json::from_str(&serialized).unwrap();

        assert_eq!(original.data_dir, deserialized.data_dir);
        assert_eq!(original.index_file, deserialized.index_file);
        assert_eq!(original.transaction_file, deserialized.transaction_file);
        assert_eq!(original.fsync_enabled, deserialized.fsync_enabled);
    }
}
