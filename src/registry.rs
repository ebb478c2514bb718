//! Ownership bookkeeping on top of a [`Provider`].
//!
//! Every record this instance creates gets a companion TXT record carrying
//! the owner id and the originating resource. On read, the companions are
//! folded back into the labels of the records they describe and hidden from
//! the result. Records without a companion are reported as unowned, which the
//! plan never deletes or overwrites.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    endpoint::{
        normalize_dns_name, parse_labels, serialize_labels, Changes, Endpoint, EndpointKey,
        Labels, RecordType, OWNED_RECORD_LABEL_KEY, OWNER_LABEL_KEY, RESOURCE_LABEL_KEY,
    },
    error::{ConfigError, ProviderError, RegistryError},
    provider::Provider,
};

#[async_trait]
pub trait Registry: Send + Sync {
    fn zone(&self) -> &str;

    /// Current records, decorated with ownership labels where known.
    async fn records(&self) -> Result<Vec<Endpoint>, RegistryError>;

    /// Write the changes and their ownership companions.
    async fn apply_changes(&self, changes: &Changes) -> Result<(), RegistryError>;

    /// Whether `records()` marked this endpoint as ours.
    fn owns(&self, endpoint: &Endpoint) -> bool;
}

// ─────────────────────────────────────────────────────────────────────────────
// Name mapper
// ─────────────────────────────────────────────────────────────────────────────

const RECORD_TYPE_TEMPLATE: &str = "%{record_type}";

/// Maps a record name to the name of its TXT ownership record and back.
///
/// Without a template the record type is embedded as `<type>-`, so A and
/// AAAA records sharing a name get distinct companions:
///
///   prefix ""      : foo.example.com  → a-foo.example.com
///   prefix "txt-"  : foo.example.com  → txt-a-foo.example.com
///   suffix "-own"  : foo.example.com  → a-foo-own.example.com
///   prefix "%{record_type}." : foo.example.com → a.foo.example.com
#[derive(Debug, Clone, Default)]
pub struct AffixNameMapper {
    prefix: String,
    suffix: String,
    wildcard_replacement: String,
}

impl AffixNameMapper {
    pub fn new(prefix: &str, suffix: &str, wildcard_replacement: &str) -> Result<Self, ConfigError> {
        if !prefix.is_empty() && !suffix.is_empty() {
            return Err(ConfigError::AffixConflict);
        }
        Ok(Self {
            prefix: prefix.to_ascii_lowercase(),
            suffix: suffix.to_ascii_lowercase(),
            wildcard_replacement: wildcard_replacement.to_ascii_lowercase(),
        })
    }

    pub fn to_txt_name(&self, dns_name: &str, record_type: RecordType) -> String {
        let name = normalize_dns_name(dns_name);
        let (first, rest) = match name.split_once('.') {
            Some((first, rest)) => (first.to_string(), Some(rest.to_string())),
            None => (name.clone(), None),
        };
        let first = if first == "*" && !self.wildcard_replacement.is_empty() {
            self.wildcard_replacement.clone()
        } else {
            first
        };
        let rt = record_type.as_str().to_ascii_lowercase();
        let join = |label: String| match &rest {
            Some(rest) => format!("{label}.{rest}"),
            None => label,
        };

        if self.prefix.contains(RECORD_TYPE_TEMPLATE) {
            format!("{}{}", self.prefix.replace(RECORD_TYPE_TEMPLATE, &rt), join(first))
        } else if self.suffix.contains(RECORD_TYPE_TEMPLATE) {
            join(format!("{first}{}", self.suffix.replace(RECORD_TYPE_TEMPLATE, &rt)))
        } else if !self.suffix.is_empty() {
            join(format!("{rt}-{first}{}", self.suffix))
        } else {
            format!("{}{rt}-{}", self.prefix, join(first))
        }
    }

    /// Inverse of [`Self::to_txt_name`]; `None` for names this mapper never produces.
    pub fn to_endpoint_name(&self, txt_name: &str) -> Option<(String, RecordType)> {
        let lower = normalize_dns_name(txt_name);
        // Longest type names first, so "aaaa-" is never read as "a-" + "aaa".
        let mut types = RecordType::ALL;
        types.sort_by_key(|t| std::cmp::Reverse(t.as_str().len()));

        types.into_iter().find_map(|rt| {
            self.strip(&lower, rt)
                .filter(|name| !name.is_empty())
                .map(|name| (self.restore_wildcard(name), rt))
        })
    }

    fn strip(&self, txt: &str, record_type: RecordType) -> Option<String> {
        let rt = record_type.as_str().to_ascii_lowercase();
        if self.prefix.contains(RECORD_TYPE_TEMPLATE) {
            let prefix = self.prefix.replace(RECORD_TYPE_TEMPLATE, &rt);
            txt.strip_prefix(prefix.as_str()).map(String::from)
        } else if self.suffix.contains(RECORD_TYPE_TEMPLATE) {
            strip_label_suffix(txt, &self.suffix.replace(RECORD_TYPE_TEMPLATE, &rt))
        } else if !self.suffix.is_empty() {
            let rest = txt.strip_prefix(format!("{rt}-").as_str())?;
            strip_label_suffix(rest, &self.suffix)
        } else {
            txt.strip_prefix(format!("{}{rt}-", self.prefix).as_str()).map(String::from)
        }
    }

    fn restore_wildcard(&self, name: String) -> String {
        if self.wildcard_replacement.is_empty() {
            return name;
        }
        match name.split_once('.') {
            Some((first, rest)) if first == self.wildcard_replacement => format!("*.{rest}"),
            None if name == self.wildcard_replacement => "*".to_string(),
            _ => name,
        }
    }
}

/// Remove `suffix` from the end of the first label of `name`.
/// The suffix itself may contain dots, e.g. `.own` in `foo.own.example.com`.
fn strip_label_suffix(name: &str, suffix: &str) -> Option<String> {
    if suffix.is_empty() {
        return Some(name.to_string());
    }
    name.match_indices(suffix).find_map(|(idx, _)| {
        let end = idx + suffix.len();
        let label = &name[..idx];
        let tail = &name[end..];
        if idx == 0 || label.contains('.') || !(tail.is_empty() || tail.starts_with('.')) {
            return None;
        }
        Some(format!("{label}{tail}"))
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// TXT registry
// ─────────────────────────────────────────────────────────────────────────────

pub struct TxtRegistry {
    provider: Arc<dyn Provider>,
    owner_id: String,
    mapper: AffixNameMapper,
    /// Provider cannot host TXT records: everything reads as unowned.
    degraded: bool,
    /// Ownership records seen by the last `records()` call.
    existing: Mutex<BTreeMap<EndpointKey, OwnershipRecord>>,
    /// Zero disables caching.
    cache_interval: Duration,
    cache: Mutex<Option<(Instant, Vec<Endpoint>)>>,
}

/// An ownership record as read from the provider.
#[derive(Debug, Clone)]
struct OwnershipRecord {
    record: Endpoint,
    labels: Labels,
}

impl OwnershipRecord {
    fn owner(&self) -> &str {
        self.labels.get(OWNER_LABEL_KEY).map(String::as_str).unwrap_or("")
    }
}

impl TxtRegistry {
    pub fn new(
        provider: Arc<dyn Provider>,
        owner_id: &str,
        mapper: AffixNameMapper,
        allow_degraded: bool,
    ) -> Result<Self, ConfigError> {
        if owner_id.trim().is_empty() {
            return Err(ConfigError::EmptyOwnerId);
        }

        let degraded = !provider.supports(RecordType::Txt);
        if degraded {
            if !allow_degraded {
                return Err(ConfigError::OwnershipUnsupported(provider.zone().to_string()));
            }
            warn!(
                zone = provider.zone(),
                "provider cannot store TXT ownership records; every existing record will be treated as unowned"
            );
        }

        Ok(Self {
            provider,
            owner_id: owner_id.to_string(),
            mapper,
            degraded,
            existing: Mutex::new(BTreeMap::new()),
            cache_interval: Duration::ZERO,
            cache: Mutex::new(None),
        })
    }

    /// Serve `records()` from memory for `interval` after each provider read.
    /// Any write drops the cache.
    pub fn with_cache_interval(mut self, interval: Duration) -> Self {
        self.cache_interval = interval;
        self
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    fn existing(&self) -> std::sync::MutexGuard<'_, BTreeMap<EndpointKey, OwnershipRecord>> {
        self.existing.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, Option<(Instant, Vec<Endpoint>)>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cached_records(&self) -> Option<Vec<Endpoint>> {
        if self.cache_interval.is_zero() {
            return None;
        }
        match self.cache().as_ref() {
            Some((read_at, records)) if read_at.elapsed() < self.cache_interval => Some(records.clone()),
            _ => None,
        }
    }

    async fn provider_records(&self) -> Result<Vec<Endpoint>, RegistryError> {
        if let Some(records) = self.cached_records() {
            debug!(zone = self.zone(), records = records.len(), "serving records from cache");
            return Ok(records);
        }
        let records = self.provider.records().await.map_err(|source| RegistryError::Read {
            zone: self.zone().to_string(),
            source,
        })?;
        if !self.cache_interval.is_zero() {
            *self.cache() = Some((Instant::now(), records.clone()));
        }
        Ok(records)
    }

    /// Companion TXT record for `ep`. Its value is derived from the labels
    /// only, so the record written at create time can be rebuilt exactly
    /// when it has to be deleted.
    fn ownership_record(&self, ep: &Endpoint) -> Endpoint {
        let mut txt = Endpoint::new(
            &self.mapper.to_txt_name(&ep.dns_name, ep.record_type),
            RecordType::Txt,
            [serialize_labels(&ep.labels)],
        )
        .with_set_identifier(&ep.set_identifier)
        .with_label(OWNED_RECORD_LABEL_KEY, &ep.dns_name);
        txt.provider_specific = ep.provider_specific.clone();
        txt
    }

    fn stamp_owner(&self, ep: &Endpoint) -> Endpoint {
        let mut ep = ep.clone();
        ep.labels.insert(OWNER_LABEL_KEY.to_string(), self.owner_id.clone());
        ep
    }

    /// Only owned records may be updated or deleted, whatever the caller
    /// passes in.
    fn filter_owned(&self, changes: &Changes) -> Changes {
        let mut out = Changes {
            create: changes.create.iter().map(|ep| self.stamp_owner(ep)).collect(),
            ..Changes::default()
        };

        for (old, new) in changes.update_old.iter().zip(&changes.update_new) {
            if self.owns(old) {
                out.update_old.push(old.clone());
                out.update_new.push(self.stamp_owner(new));
            } else {
                warn!(zone = self.zone(), record = %old, "refusing to update a record owned by someone else");
            }
        }
        for ep in &changes.delete {
            if self.owns(ep) {
                out.delete.push(ep.clone());
            } else {
                warn!(zone = self.zone(), record = %ep, "refusing to delete a record owned by someone else");
            }
        }
        out
    }

    async fn write(&self, phase: &'static str, changes: Changes) -> Result<(), RegistryError> {
        if changes.is_empty() {
            return Ok(());
        }
        debug!(zone = self.zone(), phase, operations = changes.len(), "applying batch");
        let result = self.provider.apply_changes(&changes).await;
        *self.cache() = None;
        result.map_err(|source| RegistryError::Write {
            zone: self.zone().to_string(),
            phase,
            source,
        })
    }
}

#[async_trait]
impl Registry for TxtRegistry {
    fn zone(&self) -> &str {
        self.provider.zone()
    }

    async fn records(&self) -> Result<Vec<Endpoint>, RegistryError> {
        let records = self.provider_records().await?;

        let mut owners: BTreeMap<EndpointKey, Labels> = BTreeMap::new();
        let mut existing = BTreeMap::new();
        let mut endpoints = Vec::with_capacity(records.len());

        for record in records {
            if self.degraded || record.record_type != RecordType::Txt {
                endpoints.push(record);
                continue;
            }
            let Some(value) = record.targets.first() else {
                warn!(zone = self.zone(), dns_name = %record.dns_name, "TXT record has no targets");
                continue;
            };
            let Ok(labels) = parse_labels(value) else {
                // Foreign TXT record (SPF, verification token, …): a plain record.
                endpoints.push(record);
                continue;
            };
            let Some((name, record_type)) = self.mapper.to_endpoint_name(&record.dns_name) else {
                debug!(zone = self.zone(), dns_name = %record.dns_name, "ownership record name does not match the mapper; ignoring");
                continue;
            };
            existing.insert(
                record.key(),
                OwnershipRecord {
                    record: record.clone(),
                    labels: labels.clone(),
                },
            );
            owners.insert(
                EndpointKey {
                    dns_name: name,
                    record_type,
                    set_identifier: record.set_identifier.clone(),
                },
                labels,
            );
        }

        for ep in &mut endpoints {
            // Only labels read from the ownership record count.
            ep.labels.remove(OWNER_LABEL_KEY);
            ep.labels.remove(RESOURCE_LABEL_KEY);
            if let Some(labels) = owners.remove(&ep.key()) {
                ep.labels.extend(labels);
            }
        }

        for (key, labels) in &owners {
            debug!(
                zone = self.zone(),
                %key,
                owner = labels.get(OWNER_LABEL_KEY).map(String::as_str).unwrap_or(""),
                "ownership record without a matching record"
            );
        }

        *self.existing() = existing;
        Ok(endpoints)
    }

    async fn apply_changes(&self, changes: &Changes) -> Result<(), RegistryError> {
        let mut changes = self.filter_owned(changes);

        if self.degraded {
            // Nothing is owned, so only creations survive the filter above.
            return self.write("records", changes).await;
        }

        let existing = self.existing().clone();
        let mut new_owners = Vec::new();
        let mut old_owners: Vec<Endpoint> = changes.update_old.iter().map(|ep| self.ownership_record(ep)).collect();
        let mut next_owners: Vec<Endpoint> = changes.update_new.iter().map(|ep| self.ownership_record(ep)).collect();

        // A leftover ownership record decides whether a create may proceed.
        let mut create = Vec::with_capacity(changes.create.len());
        for ep in std::mem::take(&mut changes.create) {
            let txt = self.ownership_record(&ep);
            match existing.get(&txt.key()) {
                None => new_owners.push(txt),
                Some(found) if found.owner() != self.owner_id => {
                    warn!(
                        zone = self.zone(),
                        record = %ep,
                        owner = found.owner(),
                        "ownership record names another owner; not creating"
                    );
                    continue;
                }
                Some(found) => {
                    let wanted = txt.targets.first().and_then(|value| parse_labels(value).ok());
                    if wanted.as_ref() == Some(&found.labels) {
                        debug!(zone = self.zone(), dns_name = %txt.dns_name, "ownership record already present");
                    } else {
                        debug!(zone = self.zone(), dns_name = %txt.dns_name, "refreshing stale ownership record");
                        old_owners.push(found.record.clone());
                        next_owners.push(txt);
                    }
                }
            }
            create.push(ep);
        }
        changes.create = create;
        let gone_owners: Vec<Endpoint> = changes.delete.iter().map(|ep| self.ownership_record(ep)).collect();

        info!(
            zone = self.zone(),
            create = changes.create.len(),
            update = changes.update_new.len(),
            delete = changes.delete.len(),
            "applying changes"
        );

        if self.provider.is_transactional() {
            let mut batch = changes;
            batch.create.extend(new_owners);
            batch.update_old.extend(old_owners);
            batch.update_new.extend(next_owners);
            batch.delete.extend(gone_owners);
            return self.write("transaction", batch).await;
        }

        // Non-transactional: a record is never left looking owned while it is
        // absent. Deletes drop the record before its owner; creates write the
        // owner before the record.
        self.write(
            "delete records",
            Changes {
                delete: changes.delete,
                ..Changes::default()
            },
        )
        .await?;
        self.write(
            "delete ownership",
            Changes {
                delete: gone_owners,
                ..Changes::default()
            },
        )
        .await?;
        self.write(
            "write ownership",
            Changes {
                create: new_owners,
                update_old: old_owners,
                update_new: next_owners,
                ..Changes::default()
            },
        )
        .await?;
        self.write(
            "write records",
            Changes {
                create: changes.create,
                update_old: changes.update_old,
                update_new: changes.update_new,
                ..Changes::default()
            },
        )
        .await
    }

    fn owns(&self, endpoint: &Endpoint) -> bool {
        !self.degraded && endpoint.is_owned_by(&self.owner_id)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// No-op registry
// ─────────────────────────────────────────────────────────────────────────────

/// Ownership tracking disabled: nothing is owned, so pre-existing records are
/// never deleted or overwritten and only brand-new records get created.
pub struct NoopRegistry {
    provider: Arc<dyn Provider>,
}

impl NoopRegistry {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Registry for NoopRegistry {
    fn zone(&self) -> &str {
        self.provider.zone()
    }

    async fn records(&self) -> Result<Vec<Endpoint>, RegistryError> {
        let mut records = self.provider.records().await.map_err(|source| RegistryError::Read {
            zone: self.zone().to_string(),
            source,
        })?;
        for ep in &mut records {
            ep.labels.remove(OWNER_LABEL_KEY);
        }
        Ok(records)
    }

    async fn apply_changes(&self, changes: &Changes) -> Result<(), RegistryError> {
        if changes.is_empty() {
            return Ok(());
        }
        self.provider
            .apply_changes(changes)
            .await
            .map_err(|source: ProviderError| RegistryError::Write {
                zone: self.zone().to_string(),
                phase: "records",
                source,
            })
    }

    fn owns(&self, _endpoint: &Endpoint) -> bool {
        false
    }
}
