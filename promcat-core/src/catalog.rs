use crate::discovery::DiscoveryWriter;
use crate::entry::{CatalogEntry, DiscoveryTarget, Labels};
use crate::error::{CatalogError, Result};
use crate::lock::{LockGuard, LockManager};
use crate::store::{DynRecordStore, UpsertOutcome, by_hostname};
use chrono::{DateTime, SubsecRound, Utc};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Default time-to-live for registered entries (24 hours).
pub const DEFAULT_TIME_TO_LIVE: Duration = Duration::from_secs(60 * 60 * 24);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterRequest {
    pub hostname: String,
    pub targets: Vec<String>,
    pub labels: Labels,
}

impl RegisterRequest {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ..Self::default()
        }
    }

    pub fn with_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets = targets.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_labels<I, K, V>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.labels = labels
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        self
    }

    /// Decodes a raw request body. The content type is not consulted.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|error| CatalogError::InvalidBody(error.to_string()))?;
        Self::from_json(&value)
    }

    /// Field-by-field decoding so each malformed field gets its own message.
    /// `null` targets or labels count as absent.
    pub fn from_json(value: &Value) -> Result<Self> {
        let hostname = match value.get("hostname") {
            Some(Value::String(hostname)) => hostname.clone(),
            _ => return Err(CatalogError::validation("hostname", "`hostname` is required")),
        };

        let targets = match value.get("targets") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(target) => Ok(target.clone()),
                    _ => Err(CatalogError::validation(
                        "targets",
                        "`targets` must contain only strings",
                    )),
                })
                .collect::<Result<Vec<_>>>()?,
            Some(_) => return Err(CatalogError::validation("targets", "`targets` is not a list")),
        };

        let labels = match value.get("labels") {
            None | Some(Value::Null) => Labels::new(),
            Some(Value::Object(map)) => map
                .iter()
                .map(|(key, value)| match value {
                    Value::String(value) => Ok((key.clone(), value.clone())),
                    _ => Err(CatalogError::validation(
                        "labels",
                        "`labels` values must be strings",
                    )),
                })
                .collect::<Result<Labels>>()?,
            Some(_) => return Err(CatalogError::validation("labels", "`labels` is not a dict")),
        };

        let request = Self {
            hostname,
            targets,
            labels,
        };
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hostname.trim().is_empty() {
            return Err(CatalogError::validation("hostname", "`hostname` is required"));
        }
        Ok(())
    }
}

/// Whether a registration created the entry or merged into an existing one.
/// Callers outside the crate report both the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Created,
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogMetrics {
    pub host_count: usize,
}

/// Catalog business logic: merge-on-register, duplicate rejection, expiry and
/// the discovery view. Writers serialize on the cross-process lock; readers go
/// straight to the store.
pub struct CatalogService {
    store: Arc<DynRecordStore>,
    lock: LockManager,
    discovery: DiscoveryWriter,
    time_to_live: chrono::Duration,
}

impl CatalogService {
    pub fn new(
        store: Arc<DynRecordStore>,
        lock: LockManager,
        discovery: DiscoveryWriter,
        time_to_live: Duration,
    ) -> Result<Self> {
        let time_to_live = chrono::Duration::from_std(time_to_live)
            .map_err(|error| CatalogError::Config(format!("invalid time to live: {}", error)))?;

        Ok(Self {
            store,
            lock,
            discovery,
            time_to_live,
        })
    }

    pub fn store(&self) -> &Arc<DynRecordStore> {
        &self.store
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.lock
    }

    pub fn discovery(&self) -> &DiscoveryWriter {
        &self.discovery
    }

    pub async fn register(&self, request: RegisterRequest) -> Result<RegisterOutcome> {
        self.register_at(request, Utc::now()).await
    }

    pub async fn register_at(
        &self,
        request: RegisterRequest,
        now: DateTime<Utc>,
    ) -> Result<RegisterOutcome> {
        request.validate()?;

        let guard = self.lock.acquire().await?;
        let result = self.register_locked(request, now).await;
        finish_locked(guard, result).await
    }

    async fn register_locked(
        &self,
        request: RegisterRequest,
        now: DateTime<Utc>,
    ) -> Result<RegisterOutcome> {
        let RegisterRequest {
            hostname,
            targets,
            labels,
        } = request;

        let key = by_hostname(&hostname);
        let (base_targets, base_labels) = self
            .store
            .get(&key)?
            .map(|current| (current.targets, current.labels))
            .unwrap_or_default();

        let merged_labels = merge_labels(base_labels, labels);
        let merged_targets = merge_targets(base_targets, targets);

        let duplicate = self.store.get(&|entry: &CatalogEntry| {
            entry.hostname != hostname && entry.holds_values(&merged_labels, &merged_targets)
        })?;
        if let Some(duplicate) = duplicate {
            tracing::info!(
                "Rejected registration of {}: same labels and targets as {}",
                hostname,
                duplicate.hostname
            );
            return Err(CatalogError::DuplicateConflict {
                hostname: duplicate.hostname,
            });
        }

        let entry = CatalogEntry {
            hostname: hostname.clone(),
            labels: merged_labels,
            targets: merged_targets,
            expiration: (now + self.time_to_live).trunc_subsecs(6),
        };
        let outcome = match self.store.upsert(&entry, &key)? {
            UpsertOutcome::Inserted => RegisterOutcome::Created,
            UpsertOutcome::Updated => RegisterOutcome::Updated,
        };

        self.write_discovery().await?;

        tracing::info!(
            "Registered {} ({:?}): targets={} labels={}",
            hostname,
            outcome,
            entry.targets.len(),
            entry.labels.len()
        );
        Ok(outcome)
    }

    /// Removing a hostname that is not registered is not an error.
    pub async fn unregister(&self, hostname: &str) -> Result<()> {
        let guard = self.lock.acquire().await?;
        let result = self.unregister_locked(hostname).await;
        finish_locked(guard, result).await
    }

    async fn unregister_locked(&self, hostname: &str) -> Result<()> {
        let removed = self.store.remove(&by_hostname(hostname))?;
        self.write_discovery().await?;

        tracing::info!("Unregistered {}: removed={}", hostname, removed);
        Ok(())
    }

    /// Removes every entry whose expiration is at or before now.
    pub async fn sweep_expired(&self) -> Result<usize> {
        self.sweep_expired_at(Utc::now()).await
    }

    pub async fn sweep_expired_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let guard = self.lock.acquire().await?;
        let result = self.sweep_locked(now).await;
        finish_locked(guard, result).await
    }

    async fn sweep_locked(&self, now: DateTime<Utc>) -> Result<usize> {
        let removed = self
            .store
            .remove(&|entry: &CatalogEntry| entry.is_expired_at(now))?;
        self.write_discovery().await?;

        if removed > 0 {
            tracing::info!("Removed {} expired catalog entries", removed);
        }
        Ok(removed)
    }

    /// Rewrites the discovery file from the store, e.g. at process start.
    pub async fn refresh_discovery(&self) -> Result<()> {
        let guard = self.lock.acquire().await?;
        let result = self.write_discovery().await;
        finish_locked(guard, result).await
    }

    /// Lock-free read; may observe a write from another process in progress.
    pub fn list_view(&self) -> Result<Vec<DiscoveryTarget>> {
        Ok(self
            .store
            .all()?
            .iter()
            .map(CatalogEntry::to_discovery_target)
            .collect())
    }

    pub fn metrics(&self) -> Result<CatalogMetrics> {
        Ok(CatalogMetrics {
            host_count: self.store.count()?,
        })
    }

    async fn write_discovery(&self) -> Result<()> {
        let view = self.list_view()?;
        self.discovery.write(&view).await
    }
}

/// Releases the lock, preferring the operation's own error over a release
/// failure.
async fn finish_locked<T>(guard: LockGuard, result: Result<T>) -> Result<T> {
    let released = guard.release().await;
    let value = result?;
    released?;
    Ok(value)
}

/// Incoming labels win on key collision; other existing keys are kept.
pub fn merge_labels(base: Labels, incoming: Labels) -> Labels {
    let mut merged = base;
    merged.extend(incoming);
    merged
}

/// Sorted, deduplicated union.
pub fn merge_targets(base: Vec<String>, incoming: Vec<String>) -> Vec<String> {
    base.into_iter()
        .chain(incoming)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
