use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::Utc;
use tokio::fs;
use tokio::io::AsyncWriteExt as _;
use tokio::sync::Mutex;

use crate::app::model::StartCurationRequest;
use crate::formats::{Blocker, CurationAttempt, LogEntry, SourceRow};
use crate::lease::ValidationLease;

/// Row-level persistence for attempts and everything hanging off them. Every
/// write touches a single record.
#[async_trait]
pub trait CurationStore: Send + Sync {
    async fn create(
        &self,
        attempt: &CurationAttempt,
        request: &StartCurationRequest,
    ) -> anyhow::Result<()>;
    async fn get(&self, attempt_id: &str) -> anyhow::Result<Option<CurationAttempt>>;
    async fn get_request(&self, attempt_id: &str) -> anyhow::Result<Option<StartCurationRequest>>;
    async fn put(&self, attempt: &CurationAttempt) -> anyhow::Result<()>;
    async fn exists(&self, attempt_id: &str) -> anyhow::Result<bool>;
    async fn delete(&self, attempt_id: &str) -> anyhow::Result<()>;

    async fn list_rows(&self, attempt_id: &str) -> anyhow::Result<Vec<SourceRow>>;
    async fn get_row(&self, attempt_id: &str, row_id: &str) -> anyhow::Result<Option<SourceRow>>;
    async fn upsert_row(&self, attempt_id: &str, row: &SourceRow) -> anyhow::Result<()>;
    async fn delete_rows(&self, attempt_id: &str) -> anyhow::Result<()>;

    async fn list_blockers(&self, attempt_id: &str) -> anyhow::Result<Vec<Blocker>>;
    async fn upsert_blocker(&self, attempt_id: &str, blocker: &Blocker) -> anyhow::Result<()>;

    async fn append_log(&self, attempt_id: &str, entry: &LogEntry) -> anyhow::Result<()>;
    async fn list_log(&self, attempt_id: &str) -> anyhow::Result<Vec<LogEntry>>;

    async fn get_lease(&self, attempt_id: &str) -> anyhow::Result<Option<ValidationLease>>;
    /// Reads the current lease and writes the new one as a single step. Fails
    /// with [`crate::lease::LeaseError::Held`] while another owner holds a live
    /// lease.
    async fn acquire_lease(
        &self,
        attempt_id: &str,
        owner_id: &str,
        ttl: chrono::Duration,
    ) -> anyhow::Result<ValidationLease>;
    async fn renew_lease(
        &self,
        attempt_id: &str,
        owner_id: &str,
        ttl: chrono::Duration,
    ) -> anyhow::Result<ValidationLease>;
    /// Removes the lease if `owner_id` still holds it. Returns whether it did.
    async fn release_lease(&self, attempt_id: &str, owner_id: &str) -> anyhow::Result<bool>;
    async fn delete_lease(&self, attempt_id: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct LocalFsCurationStore {
    base_dir: PathBuf,
    /// Serializes lease read-modify-write cycles across clones of this store.
    lease_lock: Arc<Mutex<()>>,
}

impl LocalFsCurationStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            lease_lock: Arc::new(Mutex::new(())),
        }
    }

    fn attempt_dir(&self, attempt_id: &str) -> PathBuf {
        self.base_dir.join("attempts").join(attempt_id)
    }

    fn attempt_json_path(&self, attempt_id: &str) -> PathBuf {
        self.attempt_dir(attempt_id).join("attempt.json")
    }

    fn request_json_path(&self, attempt_id: &str) -> PathBuf {
        self.attempt_dir(attempt_id).join("request.json")
    }

    fn rows_dir(&self, attempt_id: &str) -> PathBuf {
        self.attempt_dir(attempt_id).join("rows")
    }

    fn blockers_dir(&self, attempt_id: &str) -> PathBuf {
        self.attempt_dir(attempt_id).join("blockers")
    }

    fn log_path(&self, attempt_id: &str) -> PathBuf {
        self.attempt_dir(attempt_id).join("log.jsonl")
    }

    fn lease_path(&self, attempt_id: &str) -> PathBuf {
        self.attempt_dir(attempt_id).join("validation_lease.json")
    }

    /// Child records may only be written while the parent attempt exists.
    async fn ensure_parent(&self, attempt_id: &str) -> anyhow::Result<()> {
        if !fs::try_exists(self.attempt_json_path(attempt_id))
            .await
            .context("check attempt")?
        {
            anyhow::bail!("attempt not found: {attempt_id}");
        }
        Ok(())
    }
}

#[async_trait]
impl CurationStore for LocalFsCurationStore {
    async fn create(
        &self,
        attempt: &CurationAttempt,
        request: &StartCurationRequest,
    ) -> anyhow::Result<()> {
        let dir = self.attempt_dir(&attempt.attempt_id);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create attempt dir: {}", dir.display()))?;

        write_json_atomic(&self.request_json_path(&attempt.attempt_id), request)
            .await
            .context("write request.json")?;
        write_json_atomic(&self.attempt_json_path(&attempt.attempt_id), attempt)
            .await
            .context("write attempt.json")?;
        Ok(())
    }

    async fn get(&self, attempt_id: &str) -> anyhow::Result<Option<CurationAttempt>> {
        let path = self.attempt_json_path(attempt_id);
        read_json(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))
    }

    async fn get_request(&self, attempt_id: &str) -> anyhow::Result<Option<StartCurationRequest>> {
        let path = self.request_json_path(attempt_id);
        read_json(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))
    }

    async fn put(&self, attempt: &CurationAttempt) -> anyhow::Result<()> {
        self.ensure_parent(&attempt.attempt_id).await?;
        write_json_atomic(&self.attempt_json_path(&attempt.attempt_id), attempt)
            .await
            .context("write attempt.json")
    }

    async fn exists(&self, attempt_id: &str) -> anyhow::Result<bool> {
        fs::try_exists(self.attempt_json_path(attempt_id))
            .await
            .context("check attempt")
    }

    async fn delete(&self, attempt_id: &str) -> anyhow::Result<()> {
        let dir = self.attempt_dir(attempt_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("remove attempt dir: {}", dir.display()))
            }
        }
    }

    async fn list_rows(&self, attempt_id: &str) -> anyhow::Result<Vec<SourceRow>> {
        let mut rows: Vec<SourceRow> = read_json_dir(&self.rows_dir(attempt_id))
            .await
            .context("list rows")?;
        rows.sort_by(|a, b| {
            a.lesson_id
                .cmp(&b.lesson_id)
                .then_with(|| a.component_name.cmp(&b.component_name))
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.row_id.cmp(&b.row_id))
        });
        Ok(rows)
    }

    async fn get_row(&self, attempt_id: &str, row_id: &str) -> anyhow::Result<Option<SourceRow>> {
        let path = self.rows_dir(attempt_id).join(format!("{row_id}.json"));
        read_json(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))
    }

    async fn upsert_row(&self, attempt_id: &str, row: &SourceRow) -> anyhow::Result<()> {
        self.ensure_parent(attempt_id).await?;
        let path = self.rows_dir(attempt_id).join(format!("{}.json", row.row_id));
        write_json_atomic(&path, row)
            .await
            .with_context(|| format!("write row: {}", row.row_id))
    }

    async fn delete_rows(&self, attempt_id: &str) -> anyhow::Result<()> {
        let dir = self.rows_dir(attempt_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("remove rows dir: {}", dir.display())),
        }
    }

    async fn list_blockers(&self, attempt_id: &str) -> anyhow::Result<Vec<Blocker>> {
        let mut blockers: Vec<Blocker> = read_json_dir(&self.blockers_dir(attempt_id))
            .await
            .context("list blockers")?;
        blockers.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(blockers)
    }

    async fn upsert_blocker(&self, attempt_id: &str, blocker: &Blocker) -> anyhow::Result<()> {
        self.ensure_parent(attempt_id).await?;
        let path = self
            .blockers_dir(attempt_id)
            .join(format!("{}.json", blocker.blocker_id));
        write_json_atomic(&path, blocker)
            .await
            .with_context(|| format!("write blocker: {}", blocker.blocker_id))
    }

    async fn append_log(&self, attempt_id: &str, entry: &LogEntry) -> anyhow::Result<()> {
        self.ensure_parent(attempt_id).await?;
        let path = self.log_path(attempt_id);
        let mut line = serde_json::to_vec(entry).context("serialize log entry")?;
        line.push(b'\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("open log: {}", path.display()))?;
        file.write_all(&line)
            .await
            .with_context(|| format!("append log: {}", path.display()))?;
        file.flush().await.context("flush log")?;
        Ok(())
    }

    async fn list_log(&self, attempt_id: &str) -> anyhow::Result<Vec<LogEntry>> {
        let path = self.log_path(attempt_id);
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("read: {}", path.display())),
        };
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).context("parse log entry"))
            .collect()
    }

    async fn get_lease(&self, attempt_id: &str) -> anyhow::Result<Option<ValidationLease>> {
        let path = self.lease_path(attempt_id);
        read_json(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))
    }

    async fn acquire_lease(
        &self,
        attempt_id: &str,
        owner_id: &str,
        ttl: chrono::Duration,
    ) -> anyhow::Result<ValidationLease> {
        let _guard = self.lease_lock.lock().await;
        self.ensure_parent(attempt_id).await?;
        let current = self.get_lease(attempt_id).await?;
        let lease = ValidationLease::acquire(current.as_ref(), owner_id, ttl, Utc::now())?;
        write_json_atomic(&self.lease_path(attempt_id), &lease)
            .await
            .context("write validation lease")?;
        Ok(lease)
    }

    async fn renew_lease(
        &self,
        attempt_id: &str,
        owner_id: &str,
        ttl: chrono::Duration,
    ) -> anyhow::Result<ValidationLease> {
        let _guard = self.lease_lock.lock().await;
        self.ensure_parent(attempt_id).await?;
        let current = self.get_lease(attempt_id).await?;
        let lease = ValidationLease::renew(current.as_ref(), owner_id, ttl, Utc::now())?;
        write_json_atomic(&self.lease_path(attempt_id), &lease)
            .await
            .context("write validation lease")?;
        Ok(lease)
    }

    async fn release_lease(&self, attempt_id: &str, owner_id: &str) -> anyhow::Result<bool> {
        let _guard = self.lease_lock.lock().await;
        let current = self.get_lease(attempt_id).await?;
        if current.is_none() || ValidationLease::can_release(current.as_ref(), owner_id).is_err() {
            return Ok(false);
        }
        remove_lease_file(&self.lease_path(attempt_id)).await?;
        Ok(true)
    }

    async fn delete_lease(&self, attempt_id: &str) -> anyhow::Result<()> {
        let _guard = self.lease_lock.lock().await;
        remove_lease_file(&self.lease_path(attempt_id)).await
    }
}

async fn remove_lease_file(path: &Path) -> anyhow::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).context("remove validation lease"),
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let value = serde_json::from_slice(&bytes).context("parse json")?;
    Ok(Some(value))
}

async fn read_json_dir<T: serde::de::DeserializeOwned>(dir: &Path) -> anyhow::Result<Vec<T>> {
    let names = list_dir_names(dir, |path| {
        path.extension().and_then(|e| e.to_str()) == Some("json")
    })
    .await?;
    let mut values = Vec::with_capacity(names.len());
    for name in names {
        let path = dir.join(&name);
        if let Some(value) = read_json(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))?
        {
            values.push(value);
        }
    }
    Ok(values)
}

async fn list_dir_names(dir: &Path, keep: impl Fn(&Path) -> bool) -> anyhow::Result<Vec<String>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !keep(&path) {
            continue;
        }
        names.push(entry.file_name().to_string_lossy().to_string());
    }
    names.sort();
    Ok(names)
}

async fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("create parent dir: {}", parent.display()))?;

    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    let data = serde_json::to_vec_pretty(value).context("serialize json")?;
    fs::write(&tmp_path, &data)
        .await
        .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("rename tmp to final: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::cli::SearchEngine;
    use crate::formats::{ComponentKey, LogEntryType, RequiredComponent};
    use crate::state::AttemptState;

    fn attempt(id: &str) -> CurationAttempt {
        CurationAttempt {
            attempt_id: id.to_owned(),
            course_id: "course".to_owned(),
            attempt_number: 1,
            state: AttemptState::Draft,
            qa_decision: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn request() -> StartCurationRequest {
        StartCurationRequest {
            course_id: "course".to_owned(),
            course_title: "Course".to_owned(),
            components: vec![RequiredComponent {
                lesson_id: "L1".to_owned(),
                lesson_title: "Intro".to_owned(),
                component_name: "READING".to_owned(),
                is_critical: true,
            }],
            engine: SearchEngine::Noop,
            autostart: false,
        }
    }

    #[tokio::test]
    async fn rows_round_trip_and_upsert_in_place() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let store = LocalFsCurationStore::new(temp.path());
        let id = uuid::Uuid::new_v4().to_string();
        store.create(&attempt(&id), &request()).await?;

        let mut row = SourceRow::new(
            &ComponentKey::new("L1", "READING"),
            "https://e.com",
            "t",
            "r",
        );
        store.upsert_row(&id, &row).await?;
        row.rationale = "updated".to_owned();
        store.upsert_row(&id, &row).await?;

        let rows = store.list_rows(&id).await?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].rationale, "updated");
        Ok(())
    }

    #[tokio::test]
    async fn child_writes_fail_after_attempt_deletion() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let store = LocalFsCurationStore::new(temp.path());
        let id = uuid::Uuid::new_v4().to_string();
        store.create(&attempt(&id), &request()).await?;
        assert!(store.exists(&id).await?);

        store.delete(&id).await?;
        assert!(!store.exists(&id).await?);
        let row = SourceRow::new(&ComponentKey::new("L1", "READING"), "x", "t", "r");
        assert!(store.upsert_row(&id, &row).await.is_err());
        assert!(
            store
                .append_log(&id, &LogEntry::new(LogEntryType::Note, "late"))
                .await
                .is_err()
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_lease_requests_have_one_winner() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let store = LocalFsCurationStore::new(temp.path());
        let id = uuid::Uuid::new_v4().to_string();
        store.create(&attempt(&id), &request()).await?;
        let ttl = chrono::Duration::seconds(600);

        for round in 0..10 {
            let a = store.clone();
            let b = store.clone();
            let (id_a, id_b) = (id.clone(), id.clone());
            let (first, second) = tokio::join!(
                tokio::spawn(async move { a.acquire_lease(&id_a, "owner-a", ttl).await }),
                tokio::spawn(async move { b.acquire_lease(&id_b, "owner-b", ttl).await }),
            );
            let winners = [first?, second?]
                .into_iter()
                .filter_map(Result::ok)
                .collect::<Vec<_>>();
            assert_eq!(winners.len(), 1, "round {round}");
            assert_eq!(store.get_lease(&id).await?, Some(winners[0].clone()));

            assert!(!store.release_lease(&id, "someone-else").await?);
            assert!(store.release_lease(&id, &winners[0].owner_id).await?);
            assert!(store.get_lease(&id).await?.is_none());
        }
        Ok(())
    }

    #[tokio::test]
    async fn log_is_append_only_in_order() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let store = LocalFsCurationStore::new(temp.path());
        let id = uuid::Uuid::new_v4().to_string();
        store.create(&attempt(&id), &request()).await?;
        store
            .append_log(&id, &LogEntry::new(LogEntryType::Decision, "first"))
            .await?;
        store
            .append_log(&id, &LogEntry::new(LogEntryType::Gap, "second"))
            .await?;
        let log = store.list_log(&id).await?;
        assert_eq!(
            log.iter().map(|e| e.message.as_str()).collect::<Vec<_>>(),
            vec!["first", "second"]
        );
        Ok(())
    }
}
