use crate::{Error, Result, StorageAdapter};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One JSON file per key under `base_path`.
///
/// File names are the percent-encoded key, so distinct keys never share a
/// file. Writes go through a temp file and a rename. Compare-and-swap is
/// serialized inside this process only.
pub struct FileStorageAdapter {
    base_path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStorageAdapter {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_path)
            .map_err(|e| Error::Storage(format!("Failed to create directory: {}", e)))?;
        Ok(Self {
            base_path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn key_to_path(&self, key: &str) -> PathBuf {
        self.base_path
            .join(format!("{}.json", urlencoding::encode(key)))
    }

    fn read(&self, path: &Path) -> Result<Option<String>> {
        match fs::read_to_string(path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(format!("Failed to read file: {}", e))),
        }
    }

    fn write(&self, path: &Path, value: &str) -> Result<()> {
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, value)
            .map_err(|e| Error::Storage(format!("Failed to write file: {}", e)))?;
        fs::rename(&temp_path, path)
            .map_err(|e| Error::Storage(format!("Failed to replace file: {}", e)))
    }

    fn locked(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| Error::Storage("file store lock poisoned".to_string()))
    }
}

impl StorageAdapter for FileStorageAdapter {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.read(&self.key_to_path(key))
    }

    fn put(&self, key: &str, value: String) -> Result<()> {
        let _guard = self.locked()?;
        self.write(&self.key_to_path(key), &value)
    }

    fn del(&self, key: &str) -> Result<()> {
        let _guard = self.locked()?;
        match fs::remove_file(self.key_to_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!("Failed to delete file: {}", e))),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();

        let entries = fs::read_dir(&self.base_path)
            .map_err(|e| Error::Storage(format!("Failed to read directory: {}", e)))?;

        for entry in entries {
            let entry =
                entry.map_err(|e| Error::Storage(format!("Failed to read dir entry: {}", e)))?;

            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            let Some(encoded) = file_name.strip_suffix(".json") else {
                continue;
            };
            let Ok(key) = urlencoding::decode(encoded) else {
                continue;
            };
            if key.starts_with(prefix) {
                keys.push(key.into_owned());
            }
        }

        Ok(keys)
    }

    fn compare_and_swap(&self, key: &str, expected: Option<&str>, value: String) -> Result<bool> {
        let _guard = self.locked()?;
        let path = self.key_to_path(key);
        if self.read(&path)?.as_deref() != expected {
            return Ok(false);
        }
        self.write(&path, &value)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_storage_adapter_basic() {
        let temp_dir = TempDir::new().unwrap();
        let adapter = FileStorageAdapter::new(temp_dir.path().to_path_buf()).unwrap();

        assert!(adapter.get("test-key").unwrap().is_none());

        adapter.put("test-key", "test-value".to_string()).unwrap();
        assert_eq!(adapter.get("test-key").unwrap(), Some("test-value".to_string()));

        adapter.del("test-key").unwrap();
        assert!(adapter.get("test-key").unwrap().is_none());
        adapter.del("test-key").unwrap();
    }

    #[test]
    fn keys_with_separators_do_not_collide() {
        let temp_dir = TempDir::new().unwrap();
        let adapter = FileStorageAdapter::new(temp_dir.path().to_path_buf()).unwrap();

        adapter.put("messages/a:b/1", "slash".to_string()).unwrap();
        adapter.put("messages_a:b_1", "underscore".to_string()).unwrap();

        assert_eq!(adapter.get("messages/a:b/1").unwrap(), Some("slash".to_string()));
        assert_eq!(
            adapter.get("messages_a:b_1").unwrap(),
            Some("underscore".to_string())
        );

        let keys = adapter.list("messages/").unwrap();
        assert_eq!(keys, vec!["messages/a:b/1".to_string()]);
    }

    #[test]
    fn test_file_storage_adapter_list() {
        let temp_dir = TempDir::new().unwrap();
        let adapter = FileStorageAdapter::new(temp_dir.path().to_path_buf()).unwrap();

        adapter.put("presence/alice", "data1".to_string()).unwrap();
        adapter.put("presence/bob", "data2".to_string()).unwrap();
        adapter.put("conversations/a:b", "data3".to_string()).unwrap();

        let presence_keys = adapter.list("presence/").unwrap();
        assert_eq!(presence_keys.len(), 2);
        assert!(presence_keys.contains(&"presence/alice".to_string()));
        assert!(presence_keys.contains(&"presence/bob".to_string()));

        let all_keys = adapter.list("").unwrap();
        assert_eq!(all_keys.len(), 3);
    }

    #[test]
    fn compare_and_swap_on_disk() {
        let temp_dir = TempDir::new().unwrap();
        let adapter = FileStorageAdapter::new(temp_dir.path().to_path_buf()).unwrap();

        assert!(adapter.insert_if_absent("conv", "v1".to_string()).unwrap());
        assert!(!adapter.insert_if_absent("conv", "v2".to_string()).unwrap());
        assert!(adapter
            .compare_and_swap("conv", Some("v1"), "v2".to_string())
            .unwrap());
        assert_eq!(adapter.get("conv").unwrap(), Some("v2".to_string()));

        // Nothing half-written is left behind.
        let leftovers: Vec<_> = fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn data_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let adapter = FileStorageAdapter::new(temp_dir.path().to_path_buf()).unwrap();
            adapter.put("presence/p1", "{}".to_string()).unwrap();
        }
        let adapter = FileStorageAdapter::new(temp_dir.path().to_path_buf()).unwrap();
        assert_eq!(adapter.get("presence/p1").unwrap(), Some("{}".to_string()));
    }
}
