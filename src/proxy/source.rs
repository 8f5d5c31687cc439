use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ProxyConfig;
use crate::error::{AppError, Result};
use crate::types::ProxyIdentity;

/// Where the proxy pool gets its identity set from, both at startup and on
/// every pool-wide refresh.
#[async_trait]
pub trait IdentitySource: Send + Sync {
    async fn load(&self) -> Result<Vec<ProxyIdentity>>;
}

/// Fixed list. Refreshing re-issues the same identities, which still clears
/// every cooldown and revocation.
pub struct StaticIdentities {
    identities: Vec<ProxyIdentity>,
}

impl StaticIdentities {
    pub fn new(identities: Vec<ProxyIdentity>) -> Self {
        Self { identities }
    }

    pub fn direct() -> Self {
        Self::new(vec![ProxyIdentity::direct()])
    }
}

#[async_trait]
impl IdentitySource for StaticIdentities {
    async fn load(&self) -> Result<Vec<ProxyIdentity>> {
        Ok(self.identities.clone())
    }
}

/// One proxy URL per line, re-read on every load so an external process can
/// rotate credentials underneath us. Blank lines and `#` comments are skipped.
pub struct FileIdentities {
    path: String,
}

impl FileIdentities {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl IdentitySource for FileIdentities {
    async fn load(&self) -> Result<Vec<ProxyIdentity>> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        let identities = parse_identity_lines(&contents);
        if identities.is_empty() {
            return Err(AppError::Identity(format!("{} lists no proxies", self.path)));
        }
        Ok(identities)
    }
}

fn parse_identity_lines(contents: &str) -> Vec<ProxyIdentity> {
    let mut out: Vec<ProxyIdentity> = contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(ProxyIdentity::from_url)
        .collect();
    out.dedup();
    out
}

/// PROXY_FILE wins over PROXY_LIST; with neither set the pool holds a single
/// direct identity.
pub fn identity_source_from_config(cfg: &ProxyConfig) -> Arc<dyn IdentitySource> {
    if let Some(path) = &cfg.proxy_file {
        return Arc::new(FileIdentities::new(path.clone()));
    }
    if cfg.proxy_list.is_empty() {
        return Arc::new(StaticIdentities::direct());
    }
    Arc::new(StaticIdentities::new(
        cfg.proxy_list.iter().map(|u| ProxyIdentity::from_url(u)).collect(),
    ))
}
