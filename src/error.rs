use thiserror::Error;

use crate::endpoint::RecordType;

/// Startup-time configuration problems. Always fatal.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("unknown policy '{0}' (expected sync, upsert-only, create-only or delete-only)")]
    UnknownPolicy(String),

    #[error("unknown registry '{0}' (expected txt or noop)")]
    UnknownRegistry(String),

    #[error("unknown provider '{0}' (expected pdns or inmemory)")]
    UnknownProvider(String),

    #[error("invalid record type in {field}: {reason}")]
    RecordType { field: &'static str, reason: String },

    #[error("record type {0} cannot merge targets from several resources")]
    UnmergeableRecordType(RecordType),

    #[error("malformed domain filter entry '{0}'")]
    DomainFilter(String),

    #[error("owner id cannot be empty when the TXT registry is used")]
    EmptyOwnerId,

    #[error("txt prefix and txt suffix are mutually exclusive")]
    AffixConflict,

    #[error("provider for zone '{0}' cannot host TXT ownership records")]
    OwnershipUnsupported(String),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Failure to decode an ownership record value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LabelError {
    #[error("value does not carry the external-dns heritage marker")]
    InvalidHeritage,
}

/// Errors raised by a provider adapter while reading or writing a zone.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("record already exists: {0}")]
    RecordAlreadyExists(String),

    #[error("record not found: {0}")]
    RecordNotFound(String),

    #[error("record repeated within one batch: {0}")]
    DuplicateRecord(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Errors surfaced by a registry; wraps the provider's failure as-is.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("reading records from zone '{zone}': {source}")]
    Read {
        zone: String,
        #[source]
        source: ProviderError,
    },

    #[error("applying changes to zone '{zone}' ({phase}): {source}")]
    Write {
        zone: String,
        phase: &'static str,
        #[source]
        source: ProviderError,
    },
}
