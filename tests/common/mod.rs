//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use anyhow::anyhow;
use async_trait::async_trait;

use dns_reconciler::{
    endpoint::{Changes, Endpoint, RecordType, RESOURCE_LABEL_KEY},
    error::{ProviderError, RegistryError},
    provider::{InMemoryProvider, Provider},
    registry::{AffixNameMapper, Registry, TxtRegistry},
    source::Source,
};

pub const OWNER: &str = "owner-a";

pub fn a(name: &str, target: &str) -> Endpoint {
    Endpoint::new(name, RecordType::A, [target])
}

pub fn from_resource(ep: Endpoint, resource: &str) -> Endpoint {
    ep.with_label(RESOURCE_LABEL_KEY, resource)
}

pub fn txt_registry(provider: Arc<dyn Provider>) -> Arc<TxtRegistry> {
    Arc::new(TxtRegistry::new(provider, OWNER, AffixNameMapper::default(), false).unwrap())
}

// ── sources ──────────────────────────────────────────────────────────────────

/// Returns the same endpoints every call; the list can be swapped between cycles.
pub struct StaticSource {
    name: String,
    endpoints: Mutex<Vec<Endpoint>>,
}

impl StaticSource {
    pub fn new(name: &str, endpoints: Vec<Endpoint>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            endpoints: Mutex::new(endpoints),
        })
    }

    pub fn set(&self, endpoints: Vec<Endpoint>) {
        *self.endpoints.lock().unwrap() = endpoints;
    }
}

#[async_trait]
impl Source for StaticSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn endpoints(&self) -> anyhow::Result<Vec<Endpoint>> {
        Ok(self.endpoints.lock().unwrap().clone())
    }
}

pub struct FailingSource;

#[async_trait]
impl Source for FailingSource {
    fn name(&self) -> &str {
        "failing"
    }

    async fn endpoints(&self) -> anyhow::Result<Vec<Endpoint>> {
        Err(anyhow!("api server unreachable"))
    }
}

pub struct HangingSource;

#[async_trait]
impl Source for HangingSource {
    fn name(&self) -> &str {
        "hanging"
    }

    async fn endpoints(&self) -> anyhow::Result<Vec<Endpoint>> {
        std::future::pending().await
    }
}

// ── registries ───────────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Read,
    Write,
    Hang,
}

/// Registry for one zone that fails in a chosen way.
pub struct BrokenRegistry {
    pub zone: String,
    pub failure: Failure,
}

impl BrokenRegistry {
    pub fn new(zone: &str, failure: Failure) -> Arc<Self> {
        Arc::new(Self {
            zone: zone.to_string(),
            failure,
        })
    }
}

#[async_trait]
impl Registry for BrokenRegistry {
    fn zone(&self) -> &str {
        &self.zone
    }

    async fn records(&self) -> Result<Vec<Endpoint>, RegistryError> {
        match self.failure {
            Failure::Read => Err(RegistryError::Read {
                zone: self.zone.clone(),
                source: ProviderError::Backend(anyhow!("connection refused")),
            }),
            Failure::Hang => std::future::pending().await,
            Failure::Write => Ok(Vec::new()),
        }
    }

    async fn apply_changes(&self, _changes: &Changes) -> Result<(), RegistryError> {
        Err(RegistryError::Write {
            zone: self.zone.clone(),
            phase: "records",
            source: ProviderError::Backend(anyhow!("rate limited")),
        })
    }

    fn owns(&self, _endpoint: &Endpoint) -> bool {
        false
    }
}

// ── providers ────────────────────────────────────────────────────────────────

/// Wraps an in-memory zone, reports itself as non-transactional and keeps
/// every batch it receives.
pub struct RecordingProvider {
    pub inner: InMemoryProvider,
    pub batches: Mutex<Vec<Changes>>,
    reads: AtomicUsize,
    /// Fail the batch with this index, counting from zero.
    pub fail_batch: Option<usize>,
}

impl RecordingProvider {
    pub fn new(inner: InMemoryProvider) -> Self {
        Self {
            inner,
            batches: Mutex::new(Vec::new()),
            reads: AtomicUsize::new(0),
            fail_batch: None,
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> Vec<Changes> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for RecordingProvider {
    fn zone(&self) -> &str {
        self.inner.zone()
    }

    fn supports(&self, record_type: RecordType) -> bool {
        self.inner.supports(record_type)
    }

    async fn records(&self) -> Result<Vec<Endpoint>, ProviderError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.records().await
    }

    async fn apply_changes(&self, changes: &Changes) -> Result<(), ProviderError> {
        let idx = {
            let mut batches = self.batches.lock().unwrap();
            batches.push(changes.clone());
            batches.len() - 1
        };
        if self.fail_batch == Some(idx) {
            return Err(ProviderError::Backend(anyhow!("provider rejected batch {idx}")));
        }
        self.inner.apply_changes(changes).await
    }
}
