use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{
    domain_filter::DomainFilter,
    endpoint::{normalize_dns_name, Changes, Endpoint, EndpointKey, RecordType},
    error::ProviderError,
    provider::Provider,
};

// ─────────────────────────────────────────────────────────────────────────────
// PowerDNS API shapes (partial – only what we need)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ZoneStub {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct Zone {
    pub rrsets: Vec<RrSet>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RrSet {
    pub name: String,
    #[serde(rename = "type")]
    pub rrtype: String,
    pub ttl: u32,
    #[serde(default)]
    pub records: Vec<Record>,
    /// Used in PATCH requests; omit on read
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changetype: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub content: String,
    pub disabled: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────────────────────────

/// HTTP client for one PowerDNS server. Cheap to clone; every zone provider
/// shares the same connection pool.
#[derive(Clone)]
pub struct PdnsClient {
    http: Client,
    api_url: String,
    api_key: String,
    server_id: String,
}

impl PdnsClient {
    pub fn new(api_url: &str, api_key: &str, server_id: &str) -> Result<Self> {
        let http = Client::builder()
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            http,
            api_url: api_url.to_string(),
            api_key: api_key.to_string(),
            server_id: server_id.to_string(),
        })
    }

    fn base(&self) -> String {
        format!(
            "{}/api/v1/servers/{}",
            self.api_url.trim_end_matches('/'),
            self.server_id
        )
    }

    // ── zones ────────────────────────────────────────────────────────────────

    /// List all zones (stub objects only).
    pub async fn list_zones(&self) -> Result<Vec<ZoneStub>> {
        let url = format!("{}/zones", self.base());
        let resp = self
            .http
            .get(&url)
            .header("X-API-Key", &self.api_key)
            .send()
            .await
            .context("GET /zones")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("PowerDNS GET /zones {}: {}", status, body);
        }
        Ok(resp.json().await?)
    }

    /// Fetch a zone with all its RRsets.
    pub async fn get_zone(&self, zone_id: &str) -> Result<Zone> {
        let url = format!("{}/zones/{}", self.base(), zone_id);
        let resp = self
            .http
            .get(&url)
            .header("X-API-Key", &self.api_key)
            .send()
            .await
            .context("GET /zones/:id")?;

        if !resp.status().is_success() {
            bail!("PowerDNS GET zone {} → {}", zone_id, resp.status());
        }
        Ok(resp.json().await?)
    }

    /// Zones on the server that fall inside `filter` or contain one of its
    /// entries, without trailing dots.
    pub async fn discover_zones(&self, filter: &DomainFilter) -> Result<Vec<String>> {
        let zones = self.list_zones().await?;
        let mut names: Vec<String> = zones
            .into_iter()
            .map(|z| normalize_dns_name(&z.name))
            .filter(|name| {
                filter.matches(name)
                    || filter.include.iter().any(|entry| {
                        let entry = entry.trim_start_matches('.');
                        entry.ends_with(&format!(".{name}")) && !filter.exclude.iter().any(|x| x == name)
                    })
            })
            .collect();
        names.sort();
        debug!("discovered PowerDNS zones: {names:?}");
        Ok(names)
    }

    // ── mutations ────────────────────────────────────────────────────────────

    async fn patch_zone(&self, zone: &str, rrsets: Vec<RrSet>) -> Result<()> {
        let url = format!("{}/zones/{}", self.base(), zone);
        let payload = serde_json::json!({ "rrsets": rrsets });

        let resp = self
            .http
            .patch(&url)
            .header("X-API-Key", &self.api_key)
            .json(&payload)
            .send()
            .await
            .context("PATCH /zones/:id")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            error!("PowerDNS PATCH {zone} [{status}]: {body}");
            bail!("PowerDNS PATCH error {status}: {body}");
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Zone provider
// ─────────────────────────────────────────────────────────────────────────────

/// One PowerDNS zone. A batch is sent as a single PATCH, which PowerDNS
/// applies atomically.
pub struct PdnsProvider {
    client: PdnsClient,
    zone: String,
    zone_id: String,
    default_ttl: u32,
}

impl PdnsProvider {
    pub fn new(client: PdnsClient, zone: &str, default_ttl: u32) -> Self {
        let zone = normalize_dns_name(zone);
        let zone_id = ensure_fqdn(&zone);
        Self {
            client,
            zone,
            zone_id,
            default_ttl,
        }
    }

    fn rrsets_for(&self, changes: &Changes) -> Result<Vec<RrSet>> {
        let upserts: Vec<&Endpoint> = changes.update_new.iter().chain(&changes.create).collect();
        let replaced: Vec<EndpointKey> = upserts.iter().map(|ep| ep.key()).collect();

        for ep in upserts.iter().copied().chain(&changes.delete) {
            if !ep.set_identifier.is_empty() {
                bail!(
                    "PowerDNS has no routing policies; cannot store {} with set identifier '{}'",
                    ep.dns_name,
                    ep.set_identifier
                );
            }
        }

        let mut rrsets = Vec::with_capacity(upserts.len() + changes.delete.len());

        // REPLACE overwrites in place, so an update needs no separate delete and
        // a delete of a slot that is also being written is dropped.
        for ep in &changes.delete {
            if replaced.contains(&ep.key()) {
                continue;
            }
            info!(
                "DELETE {rtype} {name} from {zone}",
                rtype = ep.record_type,
                name = ep.dns_name,
                zone = self.zone
            );
            rrsets.push(RrSet {
                name: ensure_fqdn(&ep.dns_name),
                rrtype: ep.record_type.to_string(),
                ttl: 0,
                records: vec![],
                changetype: Some("DELETE".into()),
                comments: vec![],
            });
        }

        for ep in upserts {
            info!(
                "UPSERT {rtype} {name} → {zone}",
                rtype = ep.record_type,
                name = ep.dns_name,
                zone = self.zone
            );
            rrsets.push(build_rrset(ep, self.default_ttl, "REPLACE"));
        }

        Ok(rrsets)
    }
}

#[async_trait]
impl Provider for PdnsProvider {
    fn zone(&self) -> &str {
        &self.zone
    }

    fn is_transactional(&self) -> bool {
        true
    }

    async fn records(&self) -> Result<Vec<Endpoint>, ProviderError> {
        let zone = self.client.get_zone(&self.zone_id).await?;
        let mut endpoints = Vec::new();

        for rrset in zone.rrsets {
            // SOA and friends are never managed.
            let Ok(record_type) = rrset.rrtype.parse::<RecordType>() else {
                continue;
            };

            let targets: Vec<String> = rrset
                .records
                .iter()
                .filter(|r| !r.disabled)
                .map(|r| denormalise_target(record_type, &r.content))
                .collect();

            if targets.is_empty() {
                continue;
            }

            let mut ep = Endpoint::new(rrset.name.trim_end_matches('.'), record_type, targets);
            ep.record_ttl = Some(i64::from(rrset.ttl));
            endpoints.push(ep);
        }

        debug!(zone = %self.zone, records = endpoints.len(), "read PowerDNS zone");
        Ok(endpoints)
    }

    async fn apply_changes(&self, changes: &Changes) -> Result<(), ProviderError> {
        let rrsets = self.rrsets_for(changes)?;
        if rrsets.is_empty() {
            return Ok(());
        }
        self.client.patch_zone(&self.zone_id, rrsets).await?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn ensure_fqdn(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{name}.")
    }
}

/// Types whose value ends in a DNS name.
fn is_name_valued(record_type: RecordType) -> bool {
    matches!(
        record_type,
        RecordType::Cname | RecordType::Mx | RecordType::Ns | RecordType::Ptr | RecordType::Srv
    )
}

/// Normalise a record's content value for PowerDNS wire format.
///
/// PowerDNS requires a trailing dot on every value that is a DNS name:
///   CNAME  lb.domain.com   → lb.domain.com.
///   MX     10 mail.domain  → 10 mail.domain.
///   NS     ns1.domain.com  → ns1.domain.com.
///
/// A/AAAA records contain IP addresses – no dot needed.
/// TXT records must be quoted strings.
fn normalise_target(record_type: RecordType, target: &str) -> String {
    match record_type {
        RecordType::Txt if !target.starts_with('"') => format!("\"{target}\""),
        RecordType::Https => normalise_https_target(target),
        t if is_name_valued(t) => ensure_fqdn(target),
        _ => target.to_string(),
    }
}

/// Inverse of [`normalise_target`], so what we read compares equal to what
/// sources ask for and the plan stays quiet between cycles.
fn denormalise_target(record_type: RecordType, content: &str) -> String {
    match record_type {
        RecordType::Txt => content
            .strip_prefix('"')
            .and_then(|c| c.strip_suffix('"'))
            .unwrap_or(content)
            .to_string(),
        RecordType::Https => denormalise_https_target(content),
        t if is_name_valued(t) => content.trim_end_matches('.').to_string(),
        _ => content.to_string(),
    }
}

/// Inverse of [`normalise_https_target`]: drops the dot from the TargetName
/// unless it is the `.` alias for the owner name.
fn denormalise_https_target(content: &str) -> String {
    let parts: Vec<&str> = content.trim().splitn(3, ' ').collect();
    match parts.as_slice() {
        [priority, target, rest @ ..] if priority.parse::<u16>().is_ok() && *target != "." => {
            let mut out = format!("{priority} {}", target.trim_end_matches('.'));
            for param in rest {
                out.push(' ');
                out.push_str(param);
            }
            out
        }
        _ => content.to_string(),
    }
}

/// Format an HTTPS SvcParam string for PowerDNS.
/// Ensures a numeric SvcPriority is present and TargetName ends with a dot.
///
/// Handles:
///   "1 . alpn=h2,h3"          → "1 . alpn=h2,h3"     (already correct)
///   "1 lb.domain.com alpn=h2" → "1 lb.domain.com. alpn=h2"
///   "lb.domain.com"           → "1 lb.domain.com."    (bare hostname)
fn normalise_https_target(target: &str) -> String {
    let t = target.trim();
    let parts: Vec<&str> = t.splitn(3, ' ').collect();

    if parts.len() >= 2 && parts[0].parse::<u16>().is_ok() {
        let priority    = parts[0];
        let target_name = ensure_fqdn(parts[1]);
        let params      = parts.get(2).map(|p| format!(" {p}")).unwrap_or_default();
        return format!("{priority} {target_name}{params}");
    }

    warn!("HTTPS target '{target}' missing SvcPriority; prepending '1'");
    format!("1 {}.", t.trim_end_matches('.'))
}

fn build_rrset(ep: &Endpoint, default_ttl: u32, changetype: &str) -> RrSet {
    let ttl = ep
        .record_ttl
        .and_then(|t| u32::try_from(t).ok())
        .unwrap_or(default_ttl);

    let records: Vec<Record> = ep
        .targets
        .iter()
        .map(|t| {
            let content = normalise_target(ep.record_type, t);
            tracing::debug!(
                record_type = %ep.record_type,
                original    = %t,
                normalised  = %content,
                "normalised record content"
            );
            Record { content, disabled: false }
        })
        .collect();

    RrSet {
        name: ensure_fqdn(&ep.dns_name),
        rrtype: ep.record_type.to_string(),
        ttl,
        records,
        changetype: Some(changetype.to_string()),
        comments: vec![],
    }
}
