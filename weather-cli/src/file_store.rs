use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use weather_core::{
    KeyValueStore, StoreError,
    storage::MAX_DATA_SIZE,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum FileValue {
    Data(Vec<u8>),
    Int(i32),
}

/// Key-value store persisted as a JSON file.
///
/// Writes stay in memory until `flush`.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    values: BTreeMap<u32, FileValue>,
}

impl FileStore {
    /// Opens the store at `path`; a missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read store file: {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse store file: {}", path.display()))?
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, values })
    }

    /// Default location in the platform data directory.
    pub fn default_path() -> Result<PathBuf> {
        Ok(weather_core::Config::project_dirs()?
            .data_dir()
            .join("store.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flush(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create store directory: {}", parent.display())
            })?;
        }
        let json = serde_json::to_string_pretty(&self.values)
            .context("Failed to serialize store")?;
        fs::write(&self.path, json)
            .with_context(|| format!("Failed to write store file: {}", self.path.display()))?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn exists(&self, key: u32) -> bool {
        self.values.contains_key(&key)
    }

    fn read_data(&self, key: u32) -> Result<Option<Vec<u8>>, StoreError> {
        match self.values.get(&key) {
            None => Ok(None),
            Some(FileValue::Data(data)) => Ok(Some(data.clone())),
            Some(FileValue::Int(_)) => Err(StoreError::WrongKind(key)),
        }
    }

    fn write_data(&mut self, key: u32, data: &[u8]) -> Result<(), StoreError> {
        if data.len() > MAX_DATA_SIZE {
            return Err(StoreError::TooLarge {
                key,
                size: data.len(),
            });
        }
        self.values.insert(key, FileValue::Data(data.to_vec()));
        Ok(())
    }

    fn read_int(&self, key: u32) -> Result<Option<i32>, StoreError> {
        match self.values.get(&key) {
            None => Ok(None),
            Some(FileValue::Int(value)) => Ok(Some(*value)),
            Some(FileValue::Data(_)) => Err(StoreError::WrongKind(key)),
        }
    }

    fn write_int(&mut self, key: u32, value: i32) -> Result<(), StoreError> {
        self.values.insert(key, FileValue::Int(value));
        Ok(())
    }
}
