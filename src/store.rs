//! Persistence of log records dumped by devices.

use crate::framing::RawMessage;
use crate::identity::DeviceId;
use crate::session::{MessageHandler, Session};
use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Local;
use log::info;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Somewhere device records end up.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Stores one record and returns where it went.
    async fn store_record(&self, device: &DeviceId, payload: &[u8]) -> anyhow::Result<String>;
}

/// Writes each record to `<root>/<device id>/<timestamp>.csv`.
pub struct FileRecordStore {
    root: PathBuf,
}

impl FileRecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn free_path(&self, dir: &Path) -> anyhow::Result<PathBuf> {
        let stem = Local::now().format("%Y_%m_%d_%H_%M_%S").to_string();
        let mut candidate = dir.join(format!("{stem}.csv"));
        let mut n = 1;
        // A dump usually carries several files within the same second.
        while tokio::fs::try_exists(&candidate).await? {
            candidate = dir.join(format!("{stem}_{n}.csv"));
            n += 1;
        }
        Ok(candidate)
    }
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn store_record(&self, device: &DeviceId, payload: &[u8]) -> anyhow::Result<String> {
        let dir = self.root.join(device.as_str());
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let path = self.free_path(&dir).await?;
        tokio::fs::write(&path, payload)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path.display().to_string())
    }
}

/// Keeps records in memory, for tests and dry runs.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<Vec<(DeviceId, Bytes)>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<(DeviceId, Bytes)> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn store_record(&self, device: &DeviceId, payload: &[u8]) -> anyhow::Result<String> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.push((device.clone(), Bytes::copy_from_slice(payload)));
        Ok(format!("memory://{device}/{}", records.len() - 1))
    }
}

/// Session message handler that stores every message as a record.
pub struct RecordUploader {
    store: Arc<dyn RecordStore>,
}

impl RecordUploader {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MessageHandler for RecordUploader {
    async fn handle_message(&self, session: &Session, message: RawMessage) -> anyhow::Result<()> {
        let location = self
            .store
            .store_record(session.device_id(), &message)
            .await?;
        info!(
            target: "Gateway/Store",
            "Stored {} byte record from {} at {location}",
            message.len(),
            session.device_id()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::DeviceAddress;

    fn device() -> DeviceId {
        DeviceAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]).to_device_id()
    }

    #[tokio::test]
    async fn test_file_store_writes_under_device_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRecordStore::new(dir.path());

        let first = store.store_record(&device(), b"t,o2\n1,20.9").await.unwrap();
        let second = store.store_record(&device(), b"t,o2\n2,21.0").await.unwrap();
        assert_ne!(first, second);

        let device_dir = dir.path().join("02-ffeeddccbbaa");
        let mut names: Vec<String> = std::fs::read_dir(&device_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names.len(), 2);
        assert!(names.iter().all(|n| n.ends_with(".csv")));
        assert_eq!(std::fs::read(&first).unwrap(), b"t,o2\n1,20.9");
    }

    #[tokio::test]
    async fn test_memory_store_keeps_order() {
        let store = MemoryRecordStore::new();
        store.store_record(&device(), b"one").await.unwrap();
        store.store_record(&device(), b"two").await.unwrap();
        let payloads: Vec<_> = store.records().into_iter().map(|(_, p)| p).collect();
        assert_eq!(payloads, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);
    }
}
