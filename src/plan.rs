use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::{
    domain_filter::DomainFilter,
    endpoint::{Changes, Endpoint, EndpointKey, RecordType, OWNER_LABEL_KEY},
};

/// Compares a provider-specific property's previous and desired value.
/// Returns `true` when the two are equivalent.
pub type PropertyComparator = fn(name: &str, previous: &str, desired: &str) -> bool;

/// Record types managed when nothing else is configured.
pub const DEFAULT_MANAGED_RECORD_TYPES: [RecordType; 3] =
    [RecordType::A, RecordType::Aaaa, RecordType::Cname];

/// Turns a current and a desired record set into a [`Changes`] batch.
///
/// ```text
/// key                       | current        | desired        | action
/// --------------------------+----------------+----------------+-------------------
/// A foo.example.com         | -> 1.1.1.1     | -> 1.1.1.1     | none
/// A bar.example.com         |                | -> 10.0.0.1    | create
/// A old.example.com (owned) | -> 10.0.0.9    |                | delete
/// A ext.example.com (other) | -> 10.0.0.7    |                | none (not ours)
/// A web.example.com (owned) | -> 1.1.1.1     | -> 2.2.2.2     | update
/// ```
#[derive(Debug, Clone)]
pub struct Plan {
    pub domain_filter: DomainFilter,
    pub managed_record_types: BTreeSet<RecordType>,
    /// Wins over `managed_record_types`.
    pub excluded_record_types: BTreeSet<RecordType>,
    pub property_comparator: Option<PropertyComparator>,
}

impl Default for Plan {
    fn default() -> Self {
        Self::new(DomainFilter::all(), DEFAULT_MANAGED_RECORD_TYPES)
    }
}

#[derive(Default)]
struct Row<'a> {
    current: Option<&'a Endpoint>,
    desired: Option<&'a Endpoint>,
}

impl Plan {
    pub fn new(domain_filter: DomainFilter, managed: impl IntoIterator<Item = RecordType>) -> Self {
        Self {
            domain_filter,
            managed_record_types: managed.into_iter().collect(),
            excluded_record_types: BTreeSet::new(),
            property_comparator: None,
        }
    }

    pub fn with_excluded_record_types(mut self, excluded: impl IntoIterator<Item = RecordType>) -> Self {
        self.excluded_record_types = excluded.into_iter().collect();
        self
    }

    pub fn with_property_comparator(mut self, comparator: PropertyComparator) -> Self {
        self.property_comparator = Some(comparator);
        self
    }

    /// Compute the changes moving `current` towards `desired`.
    ///
    /// `owns` decides whether a record already present at the provider may be
    /// deleted or overwritten. Records it rejects are never touched.
    pub fn calculate<F>(&self, current: &[Endpoint], desired: &[Endpoint], owns: F) -> Changes
    where
        F: Fn(&Endpoint) -> bool,
    {
        let mut table: BTreeMap<EndpointKey, Row<'_>> = BTreeMap::new();

        for ep in current.iter().filter(|ep| self.is_relevant(ep)) {
            let row = table.entry(ep.key()).or_default();
            if row.current.is_some() {
                debug!(record = %ep, "provider reported the same record slot twice; keeping the last");
            }
            row.current = Some(ep);
        }
        // A repeated desired key means resolution was skipped upstream: last write wins.
        for ep in desired.iter().filter(|ep| self.is_relevant(ep)) {
            table.entry(ep.key()).or_default().desired = Some(ep);
        }

        let mut changes = Changes::default();

        for (key, row) in table {
            match (row.current, row.desired) {
                (None, Some(desired)) => changes.create.push(desired.clone()),
                (Some(current), None) => {
                    if owns(current) {
                        changes.delete.push(current.clone());
                    } else {
                        debug!(%key, owner = current.owner().unwrap_or(""), "not owned, leaving in place");
                    }
                }
                (Some(current), Some(desired)) => {
                    if !self.needs_update(current, desired) {
                        continue;
                    }
                    if !owns(current) {
                        debug!(%key, owner = current.owner().unwrap_or(""), "desired differs from a record we do not own; leaving in place");
                        continue;
                    }
                    changes.update_new.push(merge_for_update(current, desired));
                    changes.update_old.push(current.clone());
                }
                (None, None) => {}
            }
        }

        changes
    }

    fn is_relevant(&self, ep: &Endpoint) -> bool {
        if !self.domain_filter.matches(&ep.dns_name) {
            debug!(dns_name = %ep.dns_name, "ignoring record outside the domain filter");
            return false;
        }
        self.managed_record_types.contains(&ep.record_type) && !self.excluded_record_types.contains(&ep.record_type)
    }

    fn needs_update(&self, current: &Endpoint, desired: &Endpoint) -> bool {
        !desired.same_targets(current)
            || ttl_changed(current, desired)
            || self.provider_specific_changed(current, desired)
    }

    /// Walks the properties the provider reports. Missing desired values
    /// compare as empty, so properties a provider never echoes back cannot
    /// cause an update every cycle.
    fn provider_specific_changed(&self, current: &Endpoint, desired: &Endpoint) -> bool {
        current.provider_specific.iter().any(|c| {
            let wanted = desired.provider_specific_value(&c.name).unwrap_or("");
            match self.property_comparator {
                Some(cmp) => !cmp(&c.name, &c.value, wanted),
                None => c.value != wanted,
            }
        })
    }
}

fn ttl_changed(current: &Endpoint, desired: &Endpoint) -> bool {
    match desired.record_ttl {
        Some(ttl) => current.record_ttl != Some(ttl),
        None => false,
    }
}

/// Desired wins on every field it configures; an unconfigured TTL and the
/// owner label are carried over from the record being replaced.
fn merge_for_update(current: &Endpoint, desired: &Endpoint) -> Endpoint {
    let mut next = desired.clone();
    if next.record_ttl.is_none() {
        next.record_ttl = current.record_ttl;
    }
    if let Some(owner) = current.labels.get(OWNER_LABEL_KEY) {
        next.labels.insert(OWNER_LABEL_KEY.to_string(), owner.clone());
    }
    next
}

/// Property comparator for boolean-like values such as `"true"`/`"1"`.
/// Unparseable or empty values fall back to `default`.
pub fn compare_boolean(default: bool, previous: &str, desired: &str) -> bool {
    parse_bool(previous).unwrap_or(default) == parse_bool(desired).unwrap_or(default)
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "true" => Some(true),
        "0" | "f" | "false" => Some(false),
        _ => None,
    }
}
