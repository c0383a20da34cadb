use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::{JobStore, StoreState};
use crate::error::StoreError;
use crate::types::{Job, JobUpdate, Watermarks};

/// Durable store keeping jobs and watermarks in a single JSON document.
///
/// Every operation works on the document as it is on disk, under an advisory
/// lock on a `.lock` file beside it: reads share the lock, mutations hold it
/// exclusively across read, modify and write. Several handles, in one process
/// or several, can therefore use the same document without overwriting each
/// other. Writes go through a temporary file in the same directory followed
/// by a rename, so a crash leaves either the old or the new document.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl JsonFileStore {
    /// Open the document at `path`, starting empty if it does not exist.
    #[tracing::instrument]
    pub async fn open(path: impl Into<PathBuf> + std::fmt::Debug) -> Result<Self, StoreError> {
        let path = path.into();
        let store = Self {
            lock_path: lock_path_for(&path),
            path,
        };

        if !tokio::fs::try_exists(&store.path).await? {
            info!(path = %store.path.display(), "store file not found, starting empty");
        }
        // Surface a corrupt document now rather than on the first tick.
        let jobs = store.read(|state| state.jobs.len()).await?;
        debug!(path = %store.path.display(), jobs, "store opened");

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `view` against the current document under a shared lock.
    async fn read<T, F>(&self, view: F) -> Result<T, StoreError>
    where
        F: FnOnce(&StoreState) -> T + Send + 'static,
        T: Send + 'static,
    {
        let path = self.path.clone();
        let lock_path = self.lock_path.clone();
        tokio::task::spawn_blocking(move || {
            let lock = open_lock_file(&lock_path)?;
            lock.lock_shared()?;
            let state = read_document(&path)?;
            Ok::<_, StoreError>(view(&state))
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store reader panicked: {e}")))?
    }

    /// Apply `mutate` to the current document and persist the result, all
    /// under an exclusive lock. Nothing is written if `mutate` fails.
    async fn commit<F>(&self, mutate: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut StoreState) -> Result<(), StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        let lock_path = self.lock_path.clone();
        let jobs = tokio::task::spawn_blocking(move || {
            let lock = open_lock_file(&lock_path)?;
            lock.lock()?;
            let mut state = read_document(&path)?;
            mutate(&mut state)?;
            write_atomically(&path, &serde_json::to_vec_pretty(&state)?)?;
            Ok::<_, StoreError>(state.jobs.len())
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store writer panicked: {e}")))??;

        debug!(path = %self.path.display(), jobs, "store file written");
        Ok(())
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

/// The lock is released when the returned file is closed.
fn open_lock_file(lock_path: &Path) -> Result<File, StoreError> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)?)
}

fn read_document(path: &Path) -> Result<StoreState, StoreError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreState::default()),
        Err(e) => Err(e.into()),
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
    Ok(())
}

#[async_trait]
impl JobStore for JsonFileStore {
    async fn load_jobs_due(
        &self,
        from_exclusive: DateTime<Utc>,
        to_inclusive: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        self.read(move |state| state.jobs_due(from_exclusive, to_inclusive))
            .await
    }

    async fn save_watermarks(&self, watermarks: Watermarks) -> Result<(), StoreError> {
        self.commit(move |state| {
            state.watermarks = Some(watermarks);
            Ok(())
        })
        .await
    }

    async fn load_watermarks(&self) -> Result<Option<Watermarks>, StoreError> {
        self.read(|state| state.watermarks).await
    }

    async fn update_job_status(&self, id: &str, update: &JobUpdate) -> Result<(), StoreError> {
        let id = id.to_string();
        let update = update.clone();
        self.commit(move |state| state.apply_update(&id, &update))
            .await
    }

    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        let job = job.clone();
        self.commit(move |state| state.insert(&job)).await
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let id = id.to_string();
        self.read(move |state| state.jobs.get(&id).cloned()).await
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        self.read(|state| state.all_jobs()).await
    }
}
