use std::{collections::BTreeSet, path::PathBuf, time::Duration};

use serde::Deserialize;

use crate::{
    conflict::ConflictResolver,
    controller::ControllerSettings,
    domain_filter::DomainFilter,
    endpoint::RecordType,
    error::ConfigError,
    plan::{Plan, DEFAULT_MANAGED_RECORD_TYPES},
    policy::Policy,
    registry::AffixNameMapper,
};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Identifies this instance in ownership records
    #[serde(default = "default_owner_id")]
    pub owner_id: String,

    /// sync | upsert-only | create-only | delete-only
    #[serde(default = "default_policy")]
    pub policy: String,

    /// txt | noop
    #[serde(default = "default_registry")]
    pub registry: String,

    #[serde(default)]
    pub txt_prefix: String,

    #[serde(default)]
    pub txt_suffix: String,

    /// Replaces a leading `*` in ownership record names
    #[serde(default)]
    pub txt_wildcard_replacement: String,

    /// Run read-only against providers that cannot store TXT records
    #[serde(default)]
    pub allow_unowned_degraded: bool,

    /// Reuse a zone's records for this long after reading them; 0 = always read
    #[serde(default)]
    pub txt_cache_interval_secs: u64,

    /// Comma-separated list of zones to manage; empty = manage all
    #[serde(default)]
    pub domain_filter: String,

    /// Comma-separated list of domains never to touch
    #[serde(default)]
    pub exclude_domains: String,

    /// Comma-separated record types to manage; empty = A,AAAA,CNAME
    #[serde(default)]
    pub managed_record_types: String,

    /// Comma-separated record types never to touch, even when managed
    #[serde(default)]
    pub exclude_record_types: String,

    /// Comma-separated record types whose targets merge across resources
    #[serde(default)]
    pub merge_record_types: String,

    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_min_event_sync")]
    pub min_event_sync_interval_secs: u64,

    /// Upper bound for a source query or one zone's read/plan/apply
    #[serde(default = "default_zone_timeout")]
    pub zone_timeout_secs: u64,

    #[serde(default = "default_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default)]
    pub dry_run: bool,

    /// Run a single cycle and exit
    #[serde(default)]
    pub once: bool,

    /// pdns | inmemory
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Comma-separated JSON endpoint files
    #[serde(default)]
    pub source_files: String,

    /// Base URL of the PowerDNS HTTP API, e.g. http://powerdns:8081
    #[serde(default = "default_pdns_url")]
    pub pdns_api_url: String,

    /// PowerDNS API key (X-API-Key header)
    #[serde(default = "default_pdns_key")]
    pub pdns_api_key: String,

    /// PowerDNS server-id, almost always "localhost"
    #[serde(default = "default_server_id")]
    pub pdns_server_id: String,

    /// Default TTL when the endpoint doesn't specify one
    #[serde(default = "default_ttl")]
    pub default_ttl: u32,

    /// Port of the ops endpoint (health, last plan, trigger)
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryKind {
    Txt,
    Noop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Pdns,
    InMemory,
}

impl Config {
    /// Parse from environment variables (OWNER_ID, POLICY, PDNS_API_URL, …)
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(envy::from_env::<Config>()?)
    }

    /// Return the domain filter as a Vec<String>, empty if unconfigured.
    pub fn domain_filter_list(&self) -> Vec<String> {
        split_list(&self.domain_filter)
    }

    pub fn domain_filter(&self) -> Result<DomainFilter, ConfigError> {
        DomainFilter::new(&self.domain_filter_list(), &split_list(&self.exclude_domains))
    }

    pub fn policy(&self) -> Result<Policy, ConfigError> {
        self.policy.parse()
    }

    pub fn registry_kind(&self) -> Result<RegistryKind, ConfigError> {
        match self.registry.trim() {
            "txt" => Ok(RegistryKind::Txt),
            "noop" => Ok(RegistryKind::Noop),
            other => Err(ConfigError::UnknownRegistry(other.to_string())),
        }
    }

    pub fn provider_kind(&self) -> Result<ProviderKind, ConfigError> {
        match self.provider.trim() {
            "pdns" => Ok(ProviderKind::Pdns),
            "inmemory" => Ok(ProviderKind::InMemory),
            other => Err(ConfigError::UnknownProvider(other.to_string())),
        }
    }

    pub fn managed_record_types(&self) -> Result<BTreeSet<RecordType>, ConfigError> {
        let types = parse_types("MANAGED_RECORD_TYPES", &self.managed_record_types)?;
        if types.is_empty() {
            return Ok(DEFAULT_MANAGED_RECORD_TYPES.into_iter().collect());
        }
        Ok(types)
    }

    pub fn excluded_record_types(&self) -> Result<BTreeSet<RecordType>, ConfigError> {
        parse_types("EXCLUDE_RECORD_TYPES", &self.exclude_record_types)
    }

    pub fn txt_cache_interval(&self) -> Duration {
        Duration::from_secs(self.txt_cache_interval_secs)
    }

    pub fn name_mapper(&self) -> Result<AffixNameMapper, ConfigError> {
        AffixNameMapper::new(&self.txt_prefix, &self.txt_suffix, &self.txt_wildcard_replacement)
    }

    pub fn source_files(&self) -> Vec<PathBuf> {
        split_list(&self.source_files).into_iter().map(PathBuf::from).collect()
    }

    /// Everything the controller needs, validated. Any error here is fatal.
    pub fn controller_settings(&self) -> Result<ControllerSettings, ConfigError> {
        if self.interval_secs == 0 {
            return Err(ConfigError::Zero("INTERVAL_SECS"));
        }
        if self.zone_timeout_secs == 0 {
            return Err(ConfigError::Zero("ZONE_TIMEOUT_SECS"));
        }
        if self.worker_concurrency == 0 {
            return Err(ConfigError::Zero("WORKER_CONCURRENCY"));
        }

        let resolver = ConflictResolver::new(parse_types("MERGE_RECORD_TYPES", &self.merge_record_types)?)?;

        Ok(ControllerSettings {
            plan: Plan::new(self.domain_filter()?, self.managed_record_types()?)
                .with_excluded_record_types(self.excluded_record_types()?),
            policy: self.policy()?,
            resolver,
            interval: Duration::from_secs(self.interval_secs),
            min_event_sync_interval: Duration::from_secs(self.min_event_sync_interval_secs),
            call_timeout: Duration::from_secs(self.zone_timeout_secs),
            concurrency: self.worker_concurrency,
            dry_run: self.dry_run,
        })
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_types(field: &'static str, raw: &str) -> Result<BTreeSet<RecordType>, ConfigError> {
    split_list(raw)
        .iter()
        .map(|s| s.parse::<RecordType>().map_err(|reason| ConfigError::RecordType { field, reason }))
        .collect()
}

fn default_owner_id()  -> String { "default".into() }
fn default_policy()    -> String { "sync".into() }
fn default_registry()  -> String { "txt".into() }
fn default_provider()  -> String { "pdns".into() }
fn default_interval()  -> u64    { 60 }
fn default_min_event_sync() -> u64 { 5 }
fn default_zone_timeout()   -> u64 { 30 }
fn default_concurrency()    -> usize { 4 }
fn default_pdns_url()  -> String { "http://localhost:8081".into() }
fn default_pdns_key()  -> String { "changeme".into() }
fn default_server_id() -> String { "localhost".into() }
fn default_ttl()       -> u32    { 300 }
fn default_port()      -> u16    { 8888 }
