use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Mutex,
};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::{
    endpoint::{normalize_dns_name, Changes, Endpoint, EndpointKey, RecordType},
    error::ProviderError,
};

/// A DNS backend scoped to one zone.
///
/// Both calls are treated as stateless, idempotent RPCs: the registry calls
/// them every cycle with no setup or teardown in between.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Zone this instance manages, e.g. `example.com`.
    fn zone(&self) -> &str;

    /// Whether the backend can store records of this type.
    fn supports(&self, _record_type: RecordType) -> bool {
        true
    }

    /// `true` when one `apply_changes` call is applied all-or-nothing.
    fn is_transactional(&self) -> bool {
        false
    }

    async fn records(&self) -> Result<Vec<Endpoint>, ProviderError>;

    async fn apply_changes(&self, changes: &Changes) -> Result<(), ProviderError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory provider
// ─────────────────────────────────────────────────────────────────────────────

/// Provider keeping one zone in memory. Batches are validated before any
/// record is touched, so a rejected batch leaves the zone unchanged.
pub struct InMemoryProvider {
    zone: String,
    supported: Option<BTreeSet<RecordType>>,
    records: Mutex<BTreeMap<EndpointKey, Endpoint>>,
}

impl InMemoryProvider {
    pub fn new(zone: &str) -> Self {
        Self {
            zone: normalize_dns_name(zone),
            supported: None,
            records: Mutex::new(BTreeMap::new()),
        }
    }

    /// Restrict the record types this zone accepts.
    pub fn with_supported_types(mut self, types: impl IntoIterator<Item = RecordType>) -> Self {
        self.supported = Some(types.into_iter().collect());
        self
    }

    /// Seed records directly, bypassing validation.
    pub fn with_records(self, records: impl IntoIterator<Item = Endpoint>) -> Self {
        {
            let mut store = self.lock();
            for ep in records {
                store.insert(ep.key(), ep);
            }
        }
        self
    }

    pub fn snapshot(&self) -> Vec<Endpoint> {
        self.lock().values().cloned().collect()
    }

    pub fn get(&self, key: &EndpointKey) -> Option<Endpoint> {
        self.lock().get(key).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<EndpointKey, Endpoint>> {
        // A panic while holding the lock cannot leave the map half-written.
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn in_zone(&self, ep: &Endpoint) -> bool {
        let name = normalize_dns_name(&ep.dns_name);
        name == self.zone || name.ends_with(&format!(".{}", self.zone))
    }

    fn validate(
        &self,
        store: &BTreeMap<EndpointKey, Endpoint>,
        changes: &Changes,
    ) -> Result<(), ProviderError> {
        if changes.update_old.len() != changes.update_new.len() {
            return Err(ProviderError::Backend(anyhow::anyhow!(
                "update batch has {} old and {} new records",
                changes.update_old.len(),
                changes.update_new.len()
            )));
        }

        let all = changes
            .create
            .iter()
            .chain(&changes.update_old)
            .chain(&changes.update_new)
            .chain(&changes.delete);
        for ep in all {
            if !self.in_zone(ep) {
                return Err(ProviderError::Backend(anyhow::anyhow!(
                    "{} is outside zone {}",
                    ep.dns_name,
                    self.zone
                )));
            }
            if !self.supports(ep.record_type) {
                return Err(ProviderError::Backend(anyhow::anyhow!(
                    "zone {} does not support {} records",
                    self.zone,
                    ep.record_type
                )));
            }
        }

        let deleted = unique_keys(&changes.delete)?;
        let updated = unique_keys(&changes.update_new)?;
        let replaced = unique_keys(&changes.update_old)?;
        let created = unique_keys(&changes.create)?;

        for key in &created {
            if updated.contains(key) {
                return Err(ProviderError::DuplicateRecord(key.to_string()));
            }
            if store.contains_key(key) && !deleted.contains(key) {
                return Err(ProviderError::RecordAlreadyExists(key.to_string()));
            }
        }
        for key in deleted.iter().chain(&updated).chain(&replaced) {
            if !store.contains_key(key) {
                return Err(ProviderError::RecordNotFound(key.to_string()));
            }
        }
        Ok(())
    }
}

fn unique_keys(eps: &[Endpoint]) -> Result<BTreeSet<EndpointKey>, ProviderError> {
    let mut keys = BTreeSet::new();
    for ep in eps {
        if !keys.insert(ep.key()) {
            return Err(ProviderError::DuplicateRecord(ep.key().to_string()));
        }
    }
    Ok(keys)
}

#[async_trait]
impl Provider for InMemoryProvider {
    fn zone(&self) -> &str {
        &self.zone
    }

    fn supports(&self, record_type: RecordType) -> bool {
        self.supported
            .as_ref()
            .map_or(true, |types| types.contains(&record_type))
    }

    fn is_transactional(&self) -> bool {
        true
    }

    async fn records(&self) -> Result<Vec<Endpoint>, ProviderError> {
        Ok(self.snapshot())
    }

    async fn apply_changes(&self, changes: &Changes) -> Result<(), ProviderError> {
        let mut store = self.lock();
        self.validate(&store, changes)?;

        // Deletes first so a delete+create of one slot in a single batch works.
        for ep in &changes.delete {
            info!(zone = %self.zone, "DELETE {} {}", ep.record_type, ep.dns_name);
            store.remove(&ep.key());
        }
        for ep in &changes.update_new {
            info!(zone = %self.zone, "UPDATE {} {}", ep.record_type, ep.dns_name);
            store.insert(ep.key(), ep.clone());
        }
        for ep in &changes.create {
            info!(zone = %self.zone, "CREATE {} {}", ep.record_type, ep.dns_name);
            store.insert(ep.key(), ep.clone());
        }
        debug!(zone = %self.zone, records = store.len(), "in-memory zone updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a(name: &str, target: &str) -> Endpoint {
        Endpoint::new(name, RecordType::A, [target])
    }

    fn zone() -> InMemoryProvider {
        InMemoryProvider::new("example.com").with_records([a("web.example.com", "10.0.0.1")])
    }

    #[tokio::test]
    async fn create_update_delete() {
        let p = zone();
        p.apply_changes(&Changes {
            create: vec![a("api.example.com", "10.0.0.2")],
            update_old: vec![a("web.example.com", "10.0.0.1")],
            update_new: vec![a("web.example.com", "10.0.0.9")],
            ..Changes::default()
        })
        .await
        .unwrap();
        assert_eq!(p.get(&a("web.example.com", "").key()).unwrap().targets, vec!["10.0.0.9"]);

        p.apply_changes(&Changes {
            delete: vec![a("api.example.com", "10.0.0.2")],
            ..Changes::default()
        })
        .await
        .unwrap();
        assert_eq!(p.records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejected_batch_changes_nothing() {
        let p = zone();
        let err = p
            .apply_changes(&Changes {
                create: vec![a("api.example.com", "10.0.0.2"), a("web.example.com", "10.0.0.3")],
                ..Changes::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::RecordAlreadyExists(_)));
        assert_eq!(p.snapshot(), vec![a("web.example.com", "10.0.0.1")]);

        let err = p
            .apply_changes(&Changes {
                delete: vec![a("missing.example.com", "10.0.0.2")],
                ..Changes::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::RecordNotFound(_)));
    }

    #[tokio::test]
    async fn update_of_a_missing_record_is_not_found() {
        let p = zone();
        let err = p
            .apply_changes(&Changes {
                update_old: vec![a("missing.example.com", "10.0.0.1")],
                update_new: vec![a("web.example.com", "10.0.0.9")],
                ..Changes::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::RecordNotFound(ref key) if key.contains("missing.example.com")), "{err:?}");
        assert_eq!(p.snapshot(), vec![a("web.example.com", "10.0.0.1")]);
    }

    #[tokio::test]
    async fn delete_and_create_of_one_slot_is_a_swap() {
        let p = zone();
        p.apply_changes(&Changes {
            create: vec![a("web.example.com", "10.0.0.5")],
            delete: vec![a("web.example.com", "10.0.0.1")],
            ..Changes::default()
        })
        .await
        .unwrap();
        assert_eq!(p.snapshot(), vec![a("web.example.com", "10.0.0.5")]);
    }

    #[tokio::test]
    async fn validates_zone_types_and_duplicates() {
        let p = InMemoryProvider::new("example.com").with_supported_types([RecordType::A]);
        assert!(!p.supports(RecordType::Txt));

        let outside = Changes {
            create: vec![a("web.example.org", "10.0.0.1")],
            ..Changes::default()
        };
        assert!(matches!(p.apply_changes(&outside).await, Err(ProviderError::Backend(_))));

        let txt = Changes {
            create: vec![Endpoint::new("t.example.com", RecordType::Txt, ["x"])],
            ..Changes::default()
        };
        assert!(matches!(p.apply_changes(&txt).await, Err(ProviderError::Backend(_))));

        let twice = Changes {
            create: vec![a("Web.example.com", "10.0.0.1"), a("web.example.com.", "10.0.0.2")],
            ..Changes::default()
        };
        assert!(matches!(p.apply_changes(&twice).await, Err(ProviderError::DuplicateRecord(_))));
        assert!(p.snapshot().is_empty());
    }
}
