//! In-memory remote store for integration tests
//!
//! Stands in for a real object-storage backend: whole files live in a
//! map, directories in a set. Upload failures can be injected to
//! exercise retry and conflict handling.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use cloudmount::error::{CloudMountError, Result};
use cloudmount::remote::{RemoteClient, RemoteEntry};

const TEST_MTIME: i64 = 1_700_000_000;

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[derive(Default)]
struct State {
    files: HashMap<String, Vec<u8>>,
    dirs: HashSet<String>,
}

#[derive(Default)]
pub struct InMemoryRemote {
    state: Mutex<State>,
    fail_uploads: AtomicU32,
    upload_delay_ms: AtomicU32,
    upload_calls: AtomicU32,
    download_calls: AtomicU32,
    delete_calls: AtomicU32,
    rename_calls: AtomicU32,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_file(&self, path: &str, data: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), data.to_vec());
    }

    pub fn insert_dir(&self, path: &str) {
        self.state.lock().unwrap().dirs.insert(path.to_string());
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files.get(path).cloned()
    }

    pub fn file_names(&self) -> Vec<String> {
        self.state.lock().unwrap().files.keys().cloned().collect()
    }

    /// Make the next `n` upload calls fail with a backend error
    pub fn fail_next_uploads(&self, n: u32) {
        self.fail_uploads.store(n, Ordering::SeqCst);
    }

    /// Delay each upload, for exercising timeouts
    pub fn set_upload_delay(&self, delay: Duration) {
        self.upload_delay_ms
            .store(delay.as_millis() as u32, Ordering::SeqCst);
    }

    pub fn uploads(&self) -> u32 {
        self.upload_calls.load(Ordering::SeqCst)
    }

    pub fn downloads(&self) -> u32 {
        self.download_calls.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> u32 {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn renames(&self) -> u32 {
        self.rename_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteClient for InMemoryRemote {
    async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        let state = self.state.lock().unwrap();

        if path != "/" && !state.dirs.contains(path) {
            let has_children = state
                .files
                .keys()
                .chain(state.dirs.iter())
                .any(|p| parent_of(p) == path);
            if !has_children {
                return Err(CloudMountError::NotFound(path.to_string()));
            }
        }

        let mut entries = Vec::new();
        for (p, data) in &state.files {
            if parent_of(p) == path {
                entries.push(RemoteEntry::file(
                    name_of(p),
                    p.as_str(),
                    data.len() as u64,
                    TEST_MTIME,
                ));
            }
        }
        for d in &state.dirs {
            if parent_of(d) == path {
                entries.push(RemoteEntry::directory(name_of(d), d.as_str(), TEST_MTIME));
            }
        }
        Ok(entries)
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);

        let delay_ms = self.upload_delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms as u64)).await;
        }

        if self.fail_uploads.load(Ordering::SeqCst) > 0 {
            self.fail_uploads.fetch_sub(1, Ordering::SeqCst);
            return Err(CloudMountError::Backend(
                "injected upload failure".to_string(),
            ));
        }

        let data = std::fs::read(local)?;
        let mut state = self.state.lock().unwrap();
        if state.files.contains_key(remote) {
            return Err(CloudMountError::Conflict(remote.to_string()));
        }
        state.files.insert(remote.to_string(), data);
        Ok(())
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<()> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        let data = self
            .state
            .lock()
            .unwrap()
            .files
            .get(remote)
            .cloned()
            .ok_or_else(|| CloudMountError::NotFound(remote.to_string()))?;
        std::fs::write(local, data)?;
        Ok(())
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        self.state.lock().unwrap().dirs.insert(path.to_string());
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if state.files.remove(path).is_some() || state.dirs.remove(path) {
            Ok(())
        } else {
            Err(CloudMountError::NotFound(path.to_string()))
        }
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.rename_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if let Some(data) = state.files.remove(from) {
            state.files.insert(to.to_string(), data);
            Ok(())
        } else if state.dirs.remove(from) {
            state.dirs.insert(to.to_string());
            Ok(())
        } else {
            Err(CloudMountError::NotFound(from.to_string()))
        }
    }
}
