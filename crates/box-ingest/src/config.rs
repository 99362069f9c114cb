use crate::atomic;
use crate::coordinator::UploadLimits;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CatalogMode { #[default] Memory, Postgres }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat { #[default] Compact, Json }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub listen_addr: String,
    pub storage_root: PathBuf,
    pub artifact_file_name: String,
    pub max_file_size_gb: u64,
    pub size_tolerance_bytes: u64,
    pub max_concurrent_uploads: usize,
    pub catalog: CatalogMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    pub log_format: LogFormat,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3000".into(),
            storage_root: PathBuf::from("./data/boxes"),
            artifact_file_name: "vagrant.box".into(),
            max_file_size_gb: 10,
            size_tolerance_bytes: 0,
            max_concurrent_uploads: 32,
            catalog: CatalogMode::Memory,
            database_url: None,
            log_format: LogFormat::Compact,
        }
    }
}

impl IngestConfig {
    pub fn limits(&self) -> UploadLimits {
        UploadLimits { max_bytes: self.max_file_size_gb.saturating_mul(GIB), size_tolerance: self.size_tolerance_bytes }
    }

    /// Apply `BOXVAULT_*` / `DATABASE_URL` overrides. Unparseable values are ignored with a warning.
    pub fn apply_env(&mut self) {
        if let Some(v) = env_nonempty("BOXVAULT_LISTEN_ADDR") { self.listen_addr = v; }
        if let Some(v) = env_nonempty("BOXVAULT_STORAGE_DIR") { self.storage_root = PathBuf::from(v); }
        if let Some(v) = env_parsed("BOXVAULT_MAX_FILE_SIZE_GB") { self.max_file_size_gb = v; }
        if let Some(v) = env_parsed("BOXVAULT_MAX_CONCURRENT_UPLOADS") { self.max_concurrent_uploads = v; }
        if let Some(v) = env_nonempty("BOXVAULT_CATALOG") {
            match v.to_ascii_lowercase().as_str() {
                "memory" => self.catalog = CatalogMode::Memory,
                "postgres" => self.catalog = CatalogMode::Postgres,
                other => warn!(value = other, "config.env.invalid_catalog"),
            }
        }
        if let Some(v) = env_nonempty("DATABASE_URL") { self.database_url = Some(v); }
    }
}

fn env_nonempty(key: &str) -> Option<String> { std::env::var(key).ok().filter(|v| !v.trim().is_empty()) }

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env_nonempty(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => { warn!(key, value = %raw, "config.env.unparseable"); None }
    }
}

/// The YAML configuration document on disk.
#[derive(Debug, Clone)]
pub struct ConfigStore { path: PathBuf }

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self { Self { path: path.into() } }

    /// `BOXVAULT_CONFIG`, else `./boxvault.yaml`.
    pub fn from_env() -> Self { Self::new(env_nonempty("BOXVAULT_CONFIG").unwrap_or_else(|| "./boxvault.yaml".into())) }

    pub fn path(&self) -> &Path { &self.path }

    pub fn exists(&self) -> bool { self.path.exists() }

    pub async fn load(&self) -> Result<IngestConfig> {
        let raw = tokio::fs::read_to_string(&self.path).await.with_context(|| format!("read config {}", self.path.display()))?;
        let cfg: IngestConfig = serde_yaml::from_str(&raw).with_context(|| format!("parse config {}", self.path.display()))?;
        debug!(path = %self.path.display(), "config.load.success");
        Ok(cfg)
    }

    /// Load the document, falling back to defaults when it is missing or broken.
    /// Environment overrides are applied either way.
    pub async fn load_or_default(&self) -> IngestConfig {
        let mut cfg = match self.load().await {
            Ok(cfg) => cfg,
            Err(e) => {
                if self.exists() { warn!(path = %self.path.display(), error = %format!("{e:#}"), "config.load.fallback_defaults"); }
                else { debug!(path = %self.path.display(), "config.load.missing"); }
                IngestConfig::default()
            }
        };
        cfg.apply_env();
        cfg
    }

    /// Persist the whole document atomically.
    pub async fn save(&self, cfg: &IngestConfig) -> Result<()> {
        let yaml = serde_yaml::to_string(cfg).context("serialize config")?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.with_context(|| format!("create {}", parent.display()))?;
        }
        atomic::write_atomic(&self.path, yaml).await?;
        debug!(path = %self.path.display(), "config.save.success");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_document_keeps_defaults() {
        let cfg: IngestConfig = serde_yaml::from_str("max_file_size_gb: 2\ncatalog: postgres\n").unwrap();
        assert_eq!(cfg.max_file_size_gb, 2);
        assert_eq!(cfg.catalog, CatalogMode::Postgres);
        assert_eq!(cfg.artifact_file_name, "vagrant.box");
        assert_eq!(cfg.limits(), UploadLimits { max_bytes: 2 * GIB, size_tolerance: 0 });
    }
}
