use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::endpoint::{Endpoint, RESOURCE_LABEL_KEY};

/// Something that knows which DNS records should exist.
///
/// Implementations return an empty list, not an error, when nothing matches,
/// and tag each endpoint with a `resource` label naming where it came from.
#[async_trait]
pub trait Source: Send + Sync {
    fn name(&self) -> &str;

    async fn endpoints(&self) -> Result<Vec<Endpoint>>;
}

/// Reads a JSON array of endpoints from disk on every call.
///
/// A missing file means "no endpoints"; any other read or parse failure is
/// returned to the caller.
pub struct FileSource {
    name: String,
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            name: format!("file:{}", path.display()),
            path,
        }
    }
}

#[async_trait]
impl Source for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn endpoints(&self) -> Result<Vec<Endpoint>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(source = %self.name, "file not present; no endpoints");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e).with_context(|| format!("reading {}", self.path.display())),
        };

        let parsed: Vec<Endpoint> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing endpoints from {}", self.path.display()))?;

        // Duplicates are judged as written, before the resource label is added.
        let mut seen: Vec<&Endpoint> = Vec::with_capacity(parsed.len());
        let mut endpoints: Vec<Endpoint> = Vec::with_capacity(parsed.len());
        for (idx, ep) in parsed.iter().enumerate() {
            if seen.contains(&ep) {
                continue;
            }
            seen.push(ep);
            let mut ep = ep.clone();
            ep.labels
                .entry(RESOURCE_LABEL_KEY.to_string())
                .or_insert_with(|| format!("{}#{idx}", self.name));
            endpoints.push(ep);
        }

        debug!(source = %self.name, endpoints = endpoints.len(), "loaded endpoints");
        Ok(endpoints)
    }
}
