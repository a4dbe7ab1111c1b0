//! `utxod.toml` loading and command-line overrides.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context};
use clap::Args;
use serde::Deserialize;
use utxod_chainstate::EngineOptions;
use utxod_consensus::Network;

pub const DEFAULT_DATA_DIR: &str = "data";
pub const DEFAULT_HEADER_CACHE_CAPACITY: usize = 2016;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Memory,
    Fjall,
}

impl Backend {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "memory" => Some(Self::Memory),
            "fjall" => Some(Self::Fjall),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScriptChecks {
    Signatures,
    None,
}

impl ScriptChecks {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "signatures" => Some(Self::Signatures),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

/// Keys accepted in the config file. Everything is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub network: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub backend: Option<String>,
    pub log_level: Option<String>,
    pub header_cache_capacity: Option<usize>,
    pub checkpoints_disabled: Option<bool>,
    pub execute_all_scripts: Option<bool>,
    pub allow_nonstandard_tx: Option<bool>,
    pub skip_pow_target_check: Option<bool>,
    pub script_checks: Option<String>,
    pub db_cache_mb: Option<u64>,
}

impl FileConfig {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        toml::from_str(text).context("invalid config file")
    }

    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("in {}", path.display()))
    }
}

/// Flags that win over the config file.
#[derive(Args, Clone, Debug, Default)]
pub struct Overrides {
    /// mainnet, testnet or regtest
    #[arg(long, global = true)]
    pub network: Option<String>,
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,
    /// fjall or memory
    #[arg(long, global = true)]
    pub backend: Option<String>,
    /// Log filter, e.g. `info` or `utxod_chainstate=debug`
    #[arg(long, global = true)]
    pub log_level: Option<String>,
    #[arg(long, global = true)]
    pub header_cache_capacity: Option<usize>,
    #[arg(long, global = true)]
    pub checkpoints_disabled: bool,
    #[arg(long, global = true)]
    pub execute_all_scripts: bool,
    #[arg(long, global = true)]
    pub allow_nonstandard_tx: bool,
    #[arg(long, global = true)]
    pub skip_pow_target_check: bool,
    /// signatures or none
    #[arg(long, global = true)]
    pub script_checks: Option<String>,
    #[arg(long, global = true)]
    pub db_cache_mb: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub network: Network,
    pub data_dir: PathBuf,
    pub backend: Backend,
    pub log_level: Option<String>,
    pub header_cache_capacity: usize,
    pub engine: EngineOptions,
    pub script_checks: ScriptChecks,
    pub db_cache_bytes: Option<u64>,
}

impl Config {
    pub fn load(path: Option<&Path>, overrides: &Overrides) -> anyhow::Result<Self> {
        let file = match path {
            Some(path) => FileConfig::read(path)?,
            None => FileConfig::default(),
        };
        Self::resolve(file, overrides)
    }

    pub fn resolve(file: FileConfig, overrides: &Overrides) -> anyhow::Result<Self> {
        let network = match overrides.network.as_deref().or(file.network.as_deref()) {
            Some(value) => {
                Network::parse(value).ok_or_else(|| anyhow!("unknown network '{value}'"))?
            }
            None => Network::Mainnet,
        };
        let backend = match overrides.backend.as_deref().or(file.backend.as_deref()) {
            Some(value) => {
                Backend::parse(value).ok_or_else(|| anyhow!("unknown backend '{value}'"))?
            }
            None => Backend::Fjall,
        };
        let script_checks = match overrides
            .script_checks
            .as_deref()
            .or(file.script_checks.as_deref())
        {
            Some(value) => ScriptChecks::parse(value)
                .ok_or_else(|| anyhow!("unknown script_checks '{value}'"))?,
            None => ScriptChecks::Signatures,
        };
        let header_cache_capacity = overrides
            .header_cache_capacity
            .or(file.header_cache_capacity)
            .unwrap_or(DEFAULT_HEADER_CACHE_CAPACITY);
        if header_cache_capacity == 0 {
            bail!("header_cache_capacity must be at least 1");
        }

        let flag = |cli: bool, file: Option<bool>| cli || file.unwrap_or(false);
        let engine = EngineOptions {
            skip_pow_target_check: flag(
                overrides.skip_pow_target_check,
                file.skip_pow_target_check,
            ),
            execute_all_scripts: flag(overrides.execute_all_scripts, file.execute_all_scripts),
            checkpoints_disabled: flag(overrides.checkpoints_disabled, file.checkpoints_disabled),
            allow_nonstandard_tx: flag(overrides.allow_nonstandard_tx, file.allow_nonstandard_tx),
        };

        Ok(Self {
            network,
            data_dir: overrides
                .data_dir
                .clone()
                .or(file.data_dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            backend,
            log_level: overrides.log_level.clone().or(file.log_level),
            header_cache_capacity,
            engine,
            script_checks,
            db_cache_bytes: overrides
                .db_cache_mb
                .or(file.db_cache_mb)
                .map(|mb| mb.saturating_mul(1024 * 1024)),
        })
    }

    /// Each network keeps its own database under the data directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(self.network.as_str()).join("db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_a_file() {
        let config = Config::resolve(FileConfig::default(), &Overrides::default())
            .expect("defaults");
        assert_eq!(config.network, Network::Mainnet);
        assert_eq!(config.backend, Backend::Fjall);
        assert_eq!(config.script_checks, ScriptChecks::Signatures);
        assert_eq!(config.header_cache_capacity, DEFAULT_HEADER_CACHE_CAPACITY);
        assert!(!config.engine.checkpoints_disabled);
        assert_eq!(config.db_cache_bytes, None);
        assert_eq!(config.db_path(), PathBuf::from("data/mainnet/db"));
    }

    #[test]
    fn file_values_and_overrides() {
        let file = FileConfig::parse(
            r#"
network = "testnet"
data_dir = "/var/lib/utxod"
backend = "memory"
log_level = "debug"
header_cache_capacity = 500
execute_all_scripts = true
script_checks = "none"
db_cache_mb = 64
"#,
        )
        .expect("parse");
        let overrides = Overrides {
            network: Some("regtest".to_string()),
            allow_nonstandard_tx: true,
            ..Overrides::default()
        };
        let config = Config::resolve(file, &overrides).expect("resolve");
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.backend, Backend::Memory);
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.header_cache_capacity, 500);
        assert!(config.engine.execute_all_scripts);
        assert!(config.engine.allow_nonstandard_tx);
        assert!(!config.engine.skip_pow_target_check);
        assert_eq!(config.script_checks, ScriptChecks::None);
        assert_eq!(config.db_cache_bytes, Some(64 * 1024 * 1024));
        assert_eq!(config.db_path(), PathBuf::from("/var/lib/utxod/regtest/db"));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(FileConfig::parse("peers = 8").is_err());
        let file = FileConfig::parse("backend = \"rocksdb\"").expect("parse");
        assert!(Config::resolve(file, &Overrides::default()).is_err());
        let overrides = Overrides {
            header_cache_capacity: Some(0),
            ..Overrides::default()
        };
        assert!(Config::resolve(FileConfig::default(), &overrides).is_err());
    }

    #[test]
    fn reads_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("utxod.toml");
        fs::write(&path, "network = \"regtest\"\ncheckpoints_disabled = true\n").expect("write");
        let config = Config::load(Some(&path), &Overrides::default()).expect("load");
        assert_eq!(config.network, Network::Regtest);
        assert!(config.engine.checkpoints_disabled);
        assert!(Config::load(Some(&dir.path().join("missing.toml")), &Overrides::default()).is_err());
    }
}
