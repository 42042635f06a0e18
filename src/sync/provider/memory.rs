//! In-process backend
//!
//! `MemoryBackend` is a shared handle to one stored object. Several
//! `MemoryProvider`s (one per simulated device) can point at the same backend.
//! Failure injection and a one-shot foreign write make the failure paths of the
//! orchestrator reproducible.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use super::{ProviderAdapter, ProviderError, RemoteMetadata, WriteReceipt};

#[derive(Debug, Default)]
struct BackendState {
    content: Option<String>,
    etag_counter: u64,
    etag: Option<String>,
    last_modified: Option<DateTime<Utc>>,

    /// Every call fails with this error while set
    failure: Option<ProviderError>,

    /// Consumed one per call, before `failure`
    queued_failures: VecDeque<ProviderError>,

    /// Lands right before the next write is checked
    interleaved_write: Option<String>,

    writes: usize,
    content_reads: usize,
}

impl BackendState {
    fn store(&mut self, content: String) -> WriteReceipt {
        self.etag_counter += 1;
        let etag = format!("etag-{}", self.etag_counter);

        // Strictly increasing even when two writes share a clock tick
        let now = Utc::now();
        let stamp = match self.last_modified {
            Some(prev) if prev >= now => prev + ChronoDuration::milliseconds(1),
            _ => now,
        };

        self.content = Some(content);
        self.etag = Some(etag.clone());
        self.last_modified = Some(stamp);

        WriteReceipt {
            concurrency_token: Some(etag),
            last_modified: Some(stamp),
        }
    }

    fn check_failure(&mut self) -> Result<(), ProviderError> {
        if let Some(err) = self.queued_failures.pop_front() {
            return Err(err);
        }
        match &self.failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

/// Shared in-memory storage location
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<StdMutex<BackendState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Place content directly, as another device would
    pub fn seed(&self, content: impl Into<String>, last_modified: DateTime<Utc>) -> String {
        let mut state = self.lock();
        state.etag_counter += 1;
        let etag = format!("etag-{}", state.etag_counter);
        state.content = Some(content.into());
        state.etag = Some(etag.clone());
        state.last_modified = Some(last_modified);
        etag
    }

    /// Make every call fail with `err` until cleared with `None`
    pub fn set_failure(&self, err: Option<ProviderError>) {
        self.lock().failure = err;
    }

    /// Fail only the next call with `err`
    pub fn fail_next(&self, err: ProviderError) {
        self.lock().queued_failures.push_back(err);
    }

    /// Let a foreign device write `content` just before the next write is checked
    pub fn schedule_interleaved_write(&self, content: impl Into<String>) {
        self.lock().interleaved_write = Some(content.into());
    }

    pub fn content(&self) -> Option<String> {
        self.lock().content.clone()
    }

    pub fn etag(&self) -> Option<String> {
        self.lock().etag.clone()
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.lock().last_modified
    }

    /// Successful writes so far
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    pub fn content_reads(&self) -> usize {
        self.lock().content_reads
    }
}

/// Adapter over a `MemoryBackend`
pub struct MemoryProvider {
    id: String,
    backend: MemoryBackend,
    authenticated: AtomicBool,
    reject_auth: AtomicBool,
}

impl MemoryProvider {
    pub fn new(id: impl Into<String>, backend: MemoryBackend) -> Self {
        Self {
            id: id.into(),
            backend,
            authenticated: AtomicBool::new(false),
            reject_auth: AtomicBool::new(false),
        }
    }

    pub fn backend(&self) -> &MemoryBackend {
        &self.backend
    }

    /// Make `authenticate` fail with `AuthExpired`
    pub fn reject_authentication(&self, reject: bool) {
        self.reject_auth.store(reject, Ordering::Relaxed);
    }

    fn ensure_authenticated(&self) -> Result<(), ProviderError> {
        if self.authenticated.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(ProviderError::NotAuthenticated)
        }
    }
}

#[async_trait]
impl ProviderAdapter for MemoryProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn authenticate(&self) -> Result<String, ProviderError> {
        if self.reject_auth.load(Ordering::Relaxed) {
            return Err(ProviderError::AuthExpired);
        }
        self.authenticated.store(true, Ordering::Relaxed);
        Ok(format!("memory-token-{}", self.id))
    }

    async fn sign_out(&self) {
        self.authenticated.store(false, Ordering::Relaxed);
    }

    async fn fetch_metadata(&self) -> Result<Option<RemoteMetadata>, ProviderError> {
        self.ensure_authenticated()?;
        let mut state = self.backend.lock();
        state.check_failure()?;

        if state.content.is_none() {
            return Ok(None);
        }
        Ok(Some(RemoteMetadata {
            exists: true,
            last_modified: state.last_modified,
            concurrency_token: state.etag.clone(),
        }))
    }

    async fn fetch_content(&self) -> Result<Option<String>, ProviderError> {
        self.ensure_authenticated()?;
        let mut state = self.backend.lock();
        state.check_failure()?;
        state.content_reads += 1;
        Ok(state.content.clone())
    }

    async fn write(
        &self,
        content: &str,
        expected_token: Option<&str>,
    ) -> Result<WriteReceipt, ProviderError> {
        self.ensure_authenticated()?;
        let mut state = self.backend.lock();
        state.check_failure()?;

        if let Some(foreign) = state.interleaved_write.take() {
            state.store(foreign);
        }

        if let Some(expected) = expected_token {
            if state.etag.as_deref() != Some(expected) {
                return Err(ProviderError::ConcurrencyConflict);
            }
        }

        state.writes += 1;
        Ok(state.store(content.to_string()))
    }

    async fn delete(&self) -> Result<(), ProviderError> {
        self.ensure_authenticated()?;
        let mut state = self.backend.lock();
        state.check_failure()?;
        state.content = None;
        state.etag = None;
        state.last_modified = None;
        Ok(())
    }
}
