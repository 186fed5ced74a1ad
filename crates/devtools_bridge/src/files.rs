use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::BridgeError;

/// Maps script identifiers to sources on demand. The bridge registers files
/// it learns about from breakpoint and continue-to-location commands and
/// fetches contents for `Debugger.getScriptSource`.
#[async_trait]
pub trait FileCache: Send + Sync {
    fn register_file(&self, path: &str);
    async fn get_source(&self, path: &str) -> Result<String, BridgeError>;
}

/// Disk-backed [`FileCache`] that memoizes fetched sources. Entries can be
/// seeded up front for sources that never touch the filesystem.
#[derive(Default)]
pub struct LocalFileCache {
    entries: Mutex<HashMap<String, String>>,
}

impl LocalFileCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: &str, contents: &str) {
        self.entries
            .lock()
            .insert(path.to_string(), contents.to_string());
    }
}

#[async_trait]
impl FileCache for LocalFileCache {
    fn register_file(&self, _path: &str) {}

    async fn get_source(&self, path: &str) -> Result<String, BridgeError> {
        if let Some(contents) = self.entries.lock().get(path) {
            return Ok(contents.clone());
        }
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| BridgeError::Source {
                path: path.to_string(),
                source,
            })?;
        self.entries
            .lock()
            .insert(path.to_string(), contents.clone());
        Ok(contents)
    }
}
