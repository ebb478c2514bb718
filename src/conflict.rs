use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
};

use tracing::{debug, warn};

use crate::{
    endpoint::{Endpoint, EndpointKey, ProviderSpecific, RecordType},
    error::ConfigError,
};

/// How several desired endpoints claiming the same record slot are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// One resource wins, the others are dropped for this cycle.
    PerResource,
    /// Targets of every claimant are unioned into the winner.
    MergeTargets,
}

/// Picks exactly one endpoint per identity out of the merged source output.
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    merge_types: BTreeSet<RecordType>,
}

impl ConflictResolver {
    /// Only multi-valued types without single-owner semantics may merge.
    pub fn new(merge_types: impl IntoIterator<Item = RecordType>) -> Result<Self, ConfigError> {
        let merge_types: BTreeSet<RecordType> = merge_types.into_iter().collect();
        if let Some(bad) = merge_types
            .iter()
            .find(|t| !matches!(t, RecordType::A | RecordType::Aaaa | RecordType::Txt))
        {
            return Err(ConfigError::UnmergeableRecordType(*bad));
        }
        Ok(Self { merge_types })
    }

    pub fn strategy_for(&self, record_type: RecordType) -> Strategy {
        if self.merge_types.contains(&record_type) {
            Strategy::MergeTargets
        } else {
            Strategy::PerResource
        }
    }

    /// Resolve candidates that all share one identity.
    ///
    /// Panics on an empty list: callers only ever pass non-empty groups.
    pub fn resolve(&self, mut candidates: Vec<Endpoint>) -> Endpoint {
        assert!(!candidates.is_empty(), "conflict resolution needs at least one candidate");
        if candidates.len() == 1 {
            return candidates.remove(0);
        }

        candidates.sort_by(precedence);
        let mut rest = candidates.split_off(1);
        let mut winner = candidates.remove(0);

        match self.strategy_for(winner.record_type) {
            Strategy::PerResource => {
                for loser in &rest {
                    if same_record(&winner, loser) {
                        debug!(
                            dns_name = %winner.dns_name,
                            record_type = %winner.record_type,
                            resource = loser.resource(),
                            "duplicate desired endpoint folded into winner"
                        );
                        continue;
                    }
                    warn!(
                        dns_name = %winner.dns_name,
                        record_type = %winner.record_type,
                        winner = winner.resource(),
                        discarded = loser.resource(),
                        targets = ?loser.targets,
                        "conflicting desired endpoint discarded"
                    );
                }
            }
            Strategy::MergeTargets => {
                let mut targets: BTreeMap<String, String> = winner
                    .targets
                    .iter()
                    .map(|t| (t.to_ascii_lowercase(), t.clone()))
                    .collect();
                for other in rest.drain(..) {
                    debug!(
                        dns_name = %winner.dns_name,
                        record_type = %winner.record_type,
                        resource = other.resource(),
                        "merging targets into {}",
                        winner.resource()
                    );
                    for t in other.targets {
                        targets.entry(t.to_ascii_lowercase()).or_insert(t);
                    }
                    merge_provider_specific(&mut winner.provider_specific, other.provider_specific);
                }
                winner.targets = targets.into_values().collect();
            }
        }

        winner
    }

    /// Group a desired set by identity and resolve every group.
    pub fn resolve_all(&self, desired: Vec<Endpoint>) -> Vec<Endpoint> {
        let mut groups: BTreeMap<EndpointKey, Vec<Endpoint>> = BTreeMap::new();
        for ep in desired {
            groups.entry(ep.key()).or_default().push(ep);
        }
        groups.into_values().map(|group| self.resolve(group)).collect()
    }
}

/// Total order over every field, so the winner never depends on input order.
fn precedence(a: &Endpoint, b: &Endpoint) -> Ordering {
    a.resource()
        .cmp(b.resource())
        .then_with(|| a.sorted_targets().cmp(&b.sorted_targets()))
        .then_with(|| a.record_ttl.cmp(&b.record_ttl))
        .then_with(|| sorted_ps(&a.provider_specific).cmp(&sorted_ps(&b.provider_specific)))
        .then_with(|| a.labels.cmp(&b.labels))
        .then_with(|| a.dns_name.cmp(&b.dns_name))
        .then_with(|| a.targets.cmp(&b.targets))
        .then_with(|| a.provider_specific.cmp(&b.provider_specific))
}

fn sorted_ps(ps: &[ProviderSpecific]) -> Vec<&ProviderSpecific> {
    let mut v: Vec<&ProviderSpecific> = ps.iter().collect();
    v.sort();
    v
}

fn same_record(a: &Endpoint, b: &Endpoint) -> bool {
    a.same_targets(b)
        && a.record_ttl == b.record_ttl
        && sorted_ps(&a.provider_specific) == sorted_ps(&b.provider_specific)
}

/// Properties already on `dest` win; new names from `src` are appended.
fn merge_provider_specific(dest: &mut Vec<ProviderSpecific>, src: Vec<ProviderSpecific>) {
    for p in src {
        if !dest.iter().any(|d| d.name == p.name) {
            dest.push(p);
        }
    }
}
