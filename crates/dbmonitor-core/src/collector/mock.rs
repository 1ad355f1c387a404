//! In-memory processlist sources for testing collectors without a MySQL server.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use super::sampler::{ProcessListRow, ProcessListSource, RowSet, SourceError};
use crate::registry::{ConnectionDescriptor, Connector, PoolTuning, RegistryError, SourceHandle};

/// Builds a processlist row with the given columns and no db, state or info.
pub fn row(id: &str, user: &str, host: &str, command: &str, time: &str) -> ProcessListRow {
    ProcessListRow {
        id: Some(id.to_string()),
        user: Some(user.to_string()),
        host: Some(host.to_string()),
        db: None,
        command: Some(command.to_string()),
        time: Some(time.to_string()),
        state: None,
        info: None,
    }
}

/// Canned processlist result. Clones share the fetch counter.
#[derive(Debug, Clone)]
pub struct MockSource {
    result: Result<RowSet, SourceError>,
    delay: Option<Duration>,
    fetches: Arc<AtomicUsize>,
}

impl Default for MockSource {
    fn default() -> Self {
        Self {
            result: Ok(Vec::new()),
            delay: None,
            fetches: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl MockSource {
    pub fn with_rows(rows: RowSet) -> Self {
        Self {
            result: Ok(rows),
            ..Default::default()
        }
    }

    /// A source whose query always fails with `message`.
    pub fn failing(message: &str) -> Self {
        Self {
            result: Err(SourceError::Query(message.to_string())),
            ..Default::default()
        }
    }

    /// Waits `delay` (on the Tokio clock) before answering.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of times the query has run.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl ProcessListSource for MockSource {
    fn fetch_processlist(&self) -> BoxFuture<'_, Result<RowSet, SourceError>> {
        Box::pin(async move {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.result.clone()
        })
    }
}

#[derive(Debug, Default)]
struct ConnectorState {
    sources: HashMap<String, MockSource>,
    failing: HashSet<String>,
    opened: Vec<String>,
}

/// Connector that records every open and hands out [`MockSource`]s by host.
///
/// Hosts without a registered source get an empty one. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct RecordingConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl RecordingConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `source` for descriptors whose host is `host`.
    pub fn with_source(self, host: &str, source: MockSource) -> Self {
        self.lock().sources.insert(host.to_string(), source);
        self
    }

    /// Makes opens for `host` fail.
    pub fn failing_host(self, host: &str) -> Self {
        self.lock().failing.insert(host.to_string());
        self
    }

    /// Number of open attempts, failed ones included.
    pub fn open_count(&self) -> usize {
        self.lock().opened.len()
    }

    /// Hosts of all open attempts, in order.
    pub fn opened_hosts(&self) -> Vec<String> {
        self.lock().opened.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConnectorState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Connector for RecordingConnector {
    fn open(
        &self,
        descriptor: &ConnectionDescriptor,
        _tuning: &PoolTuning,
    ) -> Result<SourceHandle, RegistryError> {
        let mut state = self.lock();
        state.opened.push(descriptor.host.clone());

        if state.failing.contains(&descriptor.host) {
            return Err(RegistryError::Open(format!("{} unreachable", descriptor.host)));
        }

        let source = state
            .sources
            .get(&descriptor.host)
            .cloned()
            .unwrap_or_default();
        Ok(Arc::new(source))
    }
}
