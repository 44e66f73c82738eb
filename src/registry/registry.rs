//! # Load Registry
//!
//! Durable record of every running compute server's load, used by dispatch
//! workers to route tiles to the least-loaded server.
//!
//! ## File Format
//!
//! UTF-8 text, one line per server:
//! ```text
//! 5001=2,0
//! 5002=0,1
//! ```
//! `<port>=<running>,<waiting>`.
//!
//! ## Consistency
//!
//! Every operation holds the registry's single lock for its whole
//! read-modify-write. Rewrites go to `<file>.tmp` first and are renamed over
//! the registry file, so a reader never observes a half-written file. Line order is
//! preserved by rewrites, which makes it the registration order.

use log::{debug, warn};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::common::error::RegistryError;

/// Load of one compute server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadEntry {
    pub id: u16,
    pub running: usize,
    pub waiting: usize,
}

impl LoadEntry {
    pub fn total(&self) -> usize {
        self.running + self.waiting
    }

    fn to_line(self) -> String {
        format!("{}={},{}\n", self.id, self.running, self.waiting)
    }

    fn parse(line: &str) -> Option<Self> {
        let (id, counts) = line.trim().split_once('=')?;
        let (running, waiting) = counts.split_once(',')?;
        Some(Self {
            id: id.trim().parse().ok()?,
            running: running.trim().parse().ok()?,
            waiting: waiting.trim().parse().ok()?,
        })
    }
}

/// File-backed load registry shared by a fleet and its dispatchers.
///
/// Construct once and share through an `Arc`.
///
/// # Example
/// ```ignore
/// let registry = Arc::new(LoadRegistry::open("load_info.temp").await?);
/// registry.add_entry(5001, 0, 0).await?;
/// assert_eq!(registry.get_server_with_less_load().await?, Some(5001));
/// ```
pub struct LoadRegistry {
    path: PathBuf,
    temp_path: PathBuf,
    lock: Mutex<()>,
}

impl LoadRegistry {
    /// Open the registry at `path`, creating an empty file if none exists.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| RegistryError::io("create directory for", &path, e))?;
            }
        }

        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| RegistryError::io("create", &path, e))?;

        let mut temp_name = path.as_os_str().to_owned();
        temp_name.push(".tmp");

        Ok(Self {
            temp_path: PathBuf::from(temp_name),
            path,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record. The caller guarantees `id` is not registered yet.
    pub async fn add_entry(&self, id: u16, running: usize, waiting: usize) -> Result<(), RegistryError> {
        let _guard = self.lock.lock().await;

        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| RegistryError::io("open", &self.path, e))?;
        let line = LoadEntry { id, running, waiting }.to_line();
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| RegistryError::io("append to", &self.path, e))?;
        file.flush()
            .await
            .map_err(|e| RegistryError::io("append to", &self.path, e))?;

        debug!("Registry: added {}", line.trim_end());
        Ok(())
    }

    /// Replace the record for `id`, appending one if it is absent.
    pub async fn update(&self, id: u16, running: usize, waiting: usize) -> Result<(), RegistryError> {
        let _guard = self.lock.lock().await;

        let mut entries = self.read_unlocked().await?;
        let updated = LoadEntry { id, running, waiting };
        match entries.iter_mut().find(|entry| entry.id == id) {
            Some(entry) => *entry = updated,
            None => entries.push(updated),
        }

        self.rewrite_unlocked(&entries).await
    }

    /// Drop the record for `id`; absent ids are not an error.
    pub async fn remove_entry(&self, id: u16) -> Result<(), RegistryError> {
        let _guard = self.lock.lock().await;

        let mut entries = self.read_unlocked().await?;
        entries.retain(|entry| entry.id != id);

        self.rewrite_unlocked(&entries).await
    }

    /// Running + waiting tasks of `id`, or `None` if it is not registered.
    pub async fn get_load(&self, id: u16) -> Result<Option<usize>, RegistryError> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .find(|entry| entry.id == id)
            .map(|entry| entry.total()))
    }

    /// The least-loaded server, or `None` if the registry is empty.
    ///
    /// Ties go to the entry listed first in the file.
    pub async fn get_server_with_less_load(&self) -> Result<Option<u16>, RegistryError> {
        self.least_loaded_excluding(&HashSet::new()).await
    }

    /// The least-loaded server whose id is not in `excluded`.
    pub async fn least_loaded_excluding(&self, excluded: &HashSet<u16>) -> Result<Option<u16>, RegistryError> {
        let entries = self.entries().await?;
        Ok(least_loaded(&entries, excluded))
    }

    /// Snapshot of every record in file order.
    pub async fn entries(&self) -> Result<Vec<LoadEntry>, RegistryError> {
        let _guard = self.lock.lock().await;
        self.read_unlocked().await
    }

    async fn read_unlocked(&self) -> Result<Vec<LoadEntry>, RegistryError> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RegistryError::io("read", &self.path, e)),
        };

        let mut entries: Vec<LoadEntry> = Vec::new();
        for line in content.lines().filter(|line| !line.trim().is_empty()) {
            match LoadEntry::parse(line) {
                Some(entry) if entries.iter().any(|known| known.id == entry.id) => {
                    warn!("⚠️  Registry {}: duplicate entry '{}' ignored", self.path.display(), line);
                }
                Some(entry) => entries.push(entry),
                None => warn!("⚠️  Registry {}: malformed line '{}' ignored", self.path.display(), line),
            }
        }
        Ok(entries)
    }

    async fn rewrite_unlocked(&self, entries: &[LoadEntry]) -> Result<(), RegistryError> {
        let content: String = entries.iter().map(|entry| entry.to_line()).collect();

        fs::write(&self.temp_path, content)
            .await
            .map_err(|e| RegistryError::io("write", &self.temp_path, e))?;
        fs::rename(&self.temp_path, &self.path)
            .await
            .map_err(|e| RegistryError::io("replace", &self.path, e))?;

        Ok(())
    }
}

fn least_loaded(entries: &[LoadEntry], excluded: &HashSet<u16>) -> Option<u16> {
    // min_by_key keeps the first of equal minima
    entries
        .iter()
        .filter(|entry| !excluded.contains(&entry.id))
        .min_by_key(|entry| entry.total())
        .map(|entry| entry.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn registry() -> (TempDir, LoadRegistry) {
        let dir = TempDir::new().unwrap();
        let registry = LoadRegistry::open(dir.path().join("load_info.temp")).await.unwrap();
        (dir, registry)
    }

    #[tokio::test]
    async fn test_open_creates_empty_file() {
        let (_dir, registry) = registry().await;
        assert!(registry.path().exists());
        assert!(registry.entries().await.unwrap().is_empty());
        assert_eq!(registry.get_server_with_less_load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_update_then_get_load() {
        let (_dir, registry) = registry().await;
        registry.add_entry(5001, 0, 0).await.unwrap();

        registry.update(5001, 3, 4).await.unwrap();
        assert_eq!(registry.get_load(5001).await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_update_appends_missing_entry() {
        let (_dir, registry) = registry().await;
        registry.update(5002, 1, 1).await.unwrap();

        assert_eq!(
            registry.entries().await.unwrap(),
            vec![LoadEntry { id: 5002, running: 1, waiting: 1 }]
        );
    }

    #[tokio::test]
    async fn test_remove_entry_then_not_found() {
        let (_dir, registry) = registry().await;
        registry.add_entry(5001, 1, 0).await.unwrap();
        registry.add_entry(5002, 2, 0).await.unwrap();

        registry.remove_entry(5001).await.unwrap();
        assert_eq!(registry.get_load(5001).await.unwrap(), None);
        assert_eq!(registry.get_load(5002).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_least_loaded_and_tie_break() {
        let (_dir, registry) = registry().await;
        registry.add_entry(7001, 0, 0).await.unwrap();
        registry.add_entry(7002, 1, 0).await.unwrap();
        assert_eq!(registry.get_server_with_less_load().await.unwrap(), Some(7001));

        registry.update(7001, 1, 0).await.unwrap();
        assert_eq!(registry.get_server_with_less_load().await.unwrap(), Some(7001));

        registry.update(7001, 1, 1).await.unwrap();
        assert_eq!(registry.get_server_with_less_load().await.unwrap(), Some(7002));
    }

    #[tokio::test]
    async fn test_least_loaded_excluding() {
        let (_dir, registry) = registry().await;
        registry.add_entry(1, 0, 0).await.unwrap();
        registry.add_entry(2, 5, 0).await.unwrap();

        let excluded: HashSet<u16> = [1].into_iter().collect();
        assert_eq!(registry.least_loaded_excluding(&excluded).await.unwrap(), Some(2));

        let excluded: HashSet<u16> = [1, 2].into_iter().collect();
        assert_eq!(registry.least_loaded_excluding(&excluded).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_format_and_no_leftover_temp() {
        let (dir, registry) = registry().await;
        registry.add_entry(5001, 0, 0).await.unwrap();
        registry.add_entry(5002, 0, 0).await.unwrap();
        registry.update(5001, 6, 9).await.unwrap();

        let content = std::fs::read_to_string(registry.path()).unwrap();
        assert_eq!(content, "5001=6,9\n5002=0,0\n");
        assert!(!dir.path().join("load_info.temp.tmp").exists());
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("load_info.temp");
        std::fs::write(&path, "123=4.5\n456=1,2\ngarbage\n456=9,9\n").unwrap();

        let registry = LoadRegistry::open(&path).await.unwrap();
        assert_eq!(
            registry.entries().await.unwrap(),
            vec![LoadEntry { id: 456, running: 1, waiting: 2 }]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_keep_one_entry_per_id() {
        let (_dir, registry) = registry().await;
        let registry = std::sync::Arc::new(registry);
        for id in 0..4u16 {
            registry.add_entry(id, 0, 0).await.unwrap();
        }

        let mut handles = Vec::new();
        for id in 0..4u16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                for n in 0..20usize {
                    registry.update(id, n, 0).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let entries = registry.entries().await.unwrap();
        assert_eq!(entries.len(), 4);
        assert!(entries.iter().all(|entry| entry.running == 19));
    }
}
