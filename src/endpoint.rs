use std::{collections::BTreeMap, fmt, net::IpAddr, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::LabelError;

// ─────────────────────────────────────────────────────────────────────────────
// Label keys
// ─────────────────────────────────────────────────────────────────────────────

/// Owner id of the instance that created the record.
pub const OWNER_LABEL_KEY: &str = "owner";

/// Reference to the resource that asked for the record, e.g. `ingress/default/web`.
pub const RESOURCE_LABEL_KEY: &str = "resource";

/// Set on ownership records only: the DNS name of the record they annotate.
pub const OWNED_RECORD_LABEL_KEY: &str = "owned-record";

const HERITAGE: &str = "external-dns";
const LABEL_PREFIX: &str = "external-dns/";

pub type Labels = BTreeMap<String, String>;

// ─────────────────────────────────────────────────────────────────────────────
// Record types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecordType {
    A,
    #[serde(rename = "AAAA")]
    Aaaa,
    #[serde(rename = "CNAME")]
    Cname,
    #[serde(rename = "TXT")]
    Txt,
    #[serde(rename = "MX")]
    Mx,
    #[serde(rename = "NS")]
    Ns,
    #[serde(rename = "SRV")]
    Srv,
    #[serde(rename = "PTR")]
    Ptr,
    #[serde(rename = "NAPTR")]
    Naptr,
    #[serde(rename = "HTTPS")]
    Https,
}

impl RecordType {
    pub const ALL: [RecordType; 10] = [
        RecordType::A,
        RecordType::Aaaa,
        RecordType::Cname,
        RecordType::Txt,
        RecordType::Mx,
        RecordType::Ns,
        RecordType::Srv,
        RecordType::Ptr,
        RecordType::Naptr,
        RecordType::Https,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::A => "A",
            RecordType::Aaaa => "AAAA",
            RecordType::Cname => "CNAME",
            RecordType::Txt => "TXT",
            RecordType::Mx => "MX",
            RecordType::Ns => "NS",
            RecordType::Srv => "SRV",
            RecordType::Ptr => "PTR",
            RecordType::Naptr => "NAPTR",
            RecordType::Https => "HTTPS",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        RecordType::ALL
            .into_iter()
            .find(|t| t.as_str() == upper)
            .ok_or_else(|| format!("unsupported record type '{s}'"))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// external-dns endpoint model
// ─────────────────────────────────────────────────────────────────────────────

/// A provider-specific property attached to an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProviderSpecific {
    pub name: String,
    pub value: String,
}

/// One DNS endpoint as external-dns understands it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub dns_name: String,
    pub record_type: RecordType,
    #[serde(default)]
    pub targets: Vec<String>,
    /// `None` means "not configured", which is not the same as a TTL of 0.
    #[serde(rename = "recordTTL", default, skip_serializing_if = "Option::is_none")]
    pub record_ttl: Option<i64>,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub provider_specific: Vec<ProviderSpecific>,
    #[serde(default)]
    pub set_identifier: String,
}

/// Identity of a record slot: lowercase name, type, set identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey {
    pub dns_name: String,
    pub record_type: RecordType,
    pub set_identifier: String,
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.set_identifier.is_empty() {
            write!(f, "{} {}", self.record_type, self.dns_name)
        } else {
            write!(f, "{} {} [{}]", self.record_type, self.dns_name, self.set_identifier)
        }
    }
}

impl Endpoint {
    pub fn new<I, S>(dns_name: &str, record_type: RecordType, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            dns_name: dns_name.to_string(),
            record_type,
            targets: targets.into_iter().map(Into::into).collect(),
            record_ttl: None,
            labels: Labels::new(),
            provider_specific: Vec::new(),
            set_identifier: String::new(),
        }
    }

    pub fn with_ttl(mut self, ttl: i64) -> Self {
        self.record_ttl = Some(ttl);
        self
    }

    pub fn with_set_identifier(mut self, set_identifier: &str) -> Self {
        self.set_identifier = set_identifier.to_string();
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_provider_specific(mut self, name: &str, value: &str) -> Self {
        self.provider_specific.push(ProviderSpecific {
            name: name.to_string(),
            value: value.to_string(),
        });
        self
    }

    pub fn key(&self) -> EndpointKey {
        EndpointKey {
            dns_name: normalize_dns_name(&self.dns_name),
            record_type: self.record_type,
            set_identifier: self.set_identifier.clone(),
        }
    }

    pub fn owner(&self) -> Option<&str> {
        self.labels.get(OWNER_LABEL_KEY).map(String::as_str)
    }

    pub fn is_owned_by(&self, owner_id: &str) -> bool {
        self.owner() == Some(owner_id)
    }

    /// The originating resource, or `"<unknown>"` for diagnostics.
    pub fn resource(&self) -> &str {
        self.labels
            .get(RESOURCE_LABEL_KEY)
            .map(String::as_str)
            .unwrap_or("<unknown>")
    }

    pub fn provider_specific_value(&self, name: &str) -> Option<&str> {
        self.provider_specific
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }

    /// Targets sorted and lowercased, for order-independent comparison.
    /// Targets in canonical form: addresses as printed by `IpAddr`, names
    /// lowercased.
    pub fn sorted_targets(&self) -> Vec<String> {
        let mut t: Vec<String> = self
            .targets
            .iter()
            .map(|s| match s.parse::<IpAddr>() {
                Ok(ip) => ip.to_string(),
                Err(_) => s.to_ascii_lowercase(),
            })
            .collect();
        t.sort();
        t
    }

    pub fn same_targets(&self, other: &Endpoint) -> bool {
        self.sorted_targets() == other.sorted_targets()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} → {:?}", self.record_type, self.dns_name, self.targets)?;
        if let Some(ttl) = self.record_ttl {
            write!(f, " ttl={ttl}")?;
        }
        if !self.set_identifier.is_empty() {
            write!(f, " set={}", self.set_identifier)?;
        }
        Ok(())
    }
}

/// Lowercase, trimmed, no trailing dot.
pub fn normalize_dns_name(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

// ─────────────────────────────────────────────────────────────────────────────
// Ownership label encoding
//
//   "heritage=external-dns,external-dns/owner=default,external-dns/resource=ingress/ns/web"
// ─────────────────────────────────────────────────────────────────────────────

/// Serialize labels into the value of an ownership TXT record. Keys are
/// emitted in sorted order.
pub fn serialize_labels(labels: &Labels) -> String {
    let mut parts = vec![format!("heritage={HERITAGE}")];
    for (k, v) in labels {
        if k == OWNED_RECORD_LABEL_KEY {
            continue;
        }
        parts.push(format!("{LABEL_PREFIX}{k}={v}"));
    }
    format!("\"{}\"", parts.join(","))
}

/// Parse the value of an ownership TXT record back into labels.
pub fn parse_labels(value: &str) -> Result<Labels, LabelError> {
    let raw = value.trim().trim_matches('"');
    let mut labels = Labels::new();
    let mut heritage_ok = false;

    for token in raw.split(',') {
        let Some((k, v)) = token.split_once('=') else {
            continue;
        };
        if k == "heritage" {
            if v != HERITAGE {
                return Err(LabelError::InvalidHeritage);
            }
            heritage_ok = true;
            continue;
        }
        if let Some(key) = k.strip_prefix(LABEL_PREFIX) {
            labels.insert(key.to_string(), v.to_string());
        }
    }

    if !heritage_ok {
        return Err(LabelError::InvalidHeritage);
    }
    Ok(labels)
}

// ─────────────────────────────────────────────────────────────────────────────
// Changes
// ─────────────────────────────────────────────────────────────────────────────

/// The mutation set produced by the plan and consumed by a registry/provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Changes {
    #[serde(default)]
    pub create: Vec<Endpoint>,
    #[serde(default)]
    pub update_old: Vec<Endpoint>,
    #[serde(default)]
    pub update_new: Vec<Endpoint>,
    #[serde(default)]
    pub delete: Vec<Endpoint>,
}

impl Changes {
    pub fn has_changes(&self) -> bool {
        !self.create.is_empty()
            || !self.delete.is_empty()
            || self.update_old != self.update_new
    }

    pub fn is_empty(&self) -> bool {
        self.create.is_empty()
            && self.delete.is_empty()
            && self.update_old.is_empty()
            && self.update_new.is_empty()
    }

    /// Number of logical operations (an update pair counts once).
    pub fn len(&self) -> usize {
        self.create.len() + self.delete.len() + self.update_new.len()
    }
}
