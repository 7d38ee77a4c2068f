//! Flat JSON thread store + email thread identity management.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dunning-storage";

pub const DEFAULT_THREAD_FILE: &str = "email_threads.json";

const DEFAULT_COMPANY_SEGMENT: &str = "company";
const FINGERPRINT_HEX_LEN: usize = 32;

/// One persisted conversation. `thread_id` is written once at creation and
/// never recomputed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub thread_id: String,
    pub client_name: String,
    pub client_email: String,
    pub company_name: Option<String>,
    pub created_date: DateTime<Utc>,
    pub message_count: u64,
    #[serde(default)]
    pub last_subject: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadSummary {
    pub client_key: String,
    pub client_name: String,
    pub client_email: String,
    pub thread_id: String,
    pub message_count: u64,
    pub created_date: DateTime<Utc>,
    pub last_subject: String,
}

pub fn thread_key(client_name: &str, client_email: &str, company_name: Option<&str>) -> String {
    format!(
        "{client_name}_{client_email}_{}",
        company_name.unwrap_or("default")
    )
}

/// Keeps `[A-Za-z0-9.]` only; an empty result becomes `company`.
pub fn sanitize_company_segment(company_name: Option<&str>) -> String {
    let sanitized = company_name
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '.')
        .collect::<String>();
    if sanitized.is_empty() {
        DEFAULT_COMPANY_SEGMENT.to_string()
    } else {
        sanitized
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Fingerprint of a client key at a given creation instant. Folding in the
/// instant keeps tokens distinct across a clear-and-recreate cycle.
pub fn thread_fingerprint(client_key: &str, created_date: DateTime<Utc>) -> String {
    let seed = format!(
        "{client_key}@{}",
        created_date.to_rfc3339_opts(SecondsFormat::Nanos, true)
    );
    let mut digest = sha256_hex(seed.as_bytes());
    digest.truncate(FINGERPRINT_HEX_LEN);
    digest
}

pub fn thread_token(fingerprint: &str, company_name: Option<&str>) -> String {
    format!("<{fingerprint}@{}.com>", sanitize_company_segment(company_name))
}

/// Whole-document JSON file: read once, replaced atomically on every write.
#[derive(Debug, Clone)]
pub struct ThreadStore {
    path: PathBuf,
}

impl ThreadStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> anyhow::Result<BTreeMap<String, ThreadRecord>> {
        let exists = fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking {}", self.path.display()))?;
        if !exists {
            return Ok(BTreeMap::new());
        }
        let text = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        if text.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&text).with_context(|| format!("parsing {}", self.path.display()))
    }

    /// Write the full mapping via temp file + rename so readers never see a
    /// partial document.
    pub async fn save(&self, threads: &BTreeMap<String, ThreadRecord>) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(threads).context("serializing thread store")?;
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating thread store directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp thread file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp thread file {}", temp_path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing temp thread file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp thread file {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }
        Ok(())
    }
}

/// Hands out stable per-client thread tokens so reminder emails chain into one
/// conversation across runs.
///
/// Not safe for concurrent writers across processes; in-process callers
/// should share one instance behind a lock.
#[derive(Debug)]
pub struct ThreadManager {
    store: ThreadStore,
    threads: BTreeMap<String, ThreadRecord>,
}

impl ThreadManager {
    /// Opens the store at `path`. An unreadable or corrupt file is logged and
    /// treated as empty.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let store = ThreadStore::new(path);
        let threads = match store.load().await {
            Ok(threads) => threads,
            Err(err) => {
                warn!(path = %store.path().display(), error = %format!("{err:#}"), "could not load thread store; starting empty");
                BTreeMap::new()
            }
        };
        debug!(path = %store.path().display(), threads = threads.len(), "thread store opened");
        Self { store, threads }
    }

    pub fn store_path(&self) -> &Path {
        self.store.path()
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Returns the thread token for a client, creating the record on first use
    /// and bumping `message_count` on every later call.
    pub async fn get_thread_id(
        &mut self,
        client_name: &str,
        client_email: &str,
        company_name: Option<&str>,
    ) -> String {
        let client_key = thread_key(client_name, client_email, company_name);

        let token = match self.threads.get_mut(&client_key) {
            Some(record) => {
                record.message_count += 1;
                record.thread_id.clone()
            }
            None => {
                let created_date = Utc::now();
                let fingerprint = thread_fingerprint(&client_key, created_date);
                let thread_id = thread_token(&fingerprint, company_name);
                info!(client_key = %client_key, thread_id = %thread_id, "created email thread");
                self.threads.insert(
                    client_key,
                    ThreadRecord {
                        thread_id: thread_id.clone(),
                        client_name: client_name.to_string(),
                        client_email: client_email.to_string(),
                        company_name: company_name.map(str::to_string),
                        created_date,
                        message_count: 0,
                        last_subject: None,
                    },
                );
                thread_id
            }
        };

        self.persist().await;
        token
    }

    pub fn get_thread_info(
        &self,
        client_name: &str,
        client_email: &str,
        company_name: Option<&str>,
    ) -> Option<&ThreadRecord> {
        self.threads
            .get(&thread_key(client_name, client_email, company_name))
    }

    /// Silently ignores clients that have no thread yet.
    pub async fn update_thread_subject(
        &mut self,
        client_name: &str,
        client_email: &str,
        subject: &str,
        company_name: Option<&str>,
    ) {
        let client_key = thread_key(client_name, client_email, company_name);
        if let Some(record) = self.threads.get_mut(&client_key) {
            record.last_subject = Some(subject.to_string());
            self.persist().await;
        }
    }

    /// Drops every thread. Irreversible.
    pub async fn clear_threads(&mut self) {
        let cleared = self.threads.len();
        self.threads.clear();
        self.persist().await;
        info!(cleared, "cleared all email threads");
    }

    pub fn list_threads(&self) -> Vec<ThreadSummary> {
        self.threads
            .iter()
            .map(|(client_key, record)| ThreadSummary {
                client_key: client_key.clone(),
                client_name: record.client_name.clone(),
                client_email: record.client_email.clone(),
                thread_id: record.thread_id.clone(),
                message_count: record.message_count,
                created_date: record.created_date,
                last_subject: record.last_subject.clone().unwrap_or_default(),
            })
            .collect()
    }

    async fn persist(&self) {
        if let Err(err) = self.store.save(&self.threads).await {
            warn!(path = %self.store.path().display(), error = %format!("{err:#}"), "could not save thread store; keeping in-memory state");
        }
    }
}
