//! Config parsers for the probe settings.
//!
//! Settings are looked up in `singleton.toml`, `.singleton.toml` or in the
//! `[package.metadata.singleton]` table of a `Cargo.toml`.
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::probe::Strategy;

const DEFAULT_THREADS: usize = 10;

const DEFAULT_CALLS: usize = 3;

pub const SUPPORTED_FILE_NAMES: &[&str] = &["singleton.toml", ".singleton.toml", "Cargo.toml"];

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub probe: ProbeConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
#[serde(rename_all = "kebab-case")]
pub struct CargoTomlConfig {
    pub package: CargoTomlPackage,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
#[serde(rename_all = "kebab-case")]
pub struct CargoTomlPackage {
    pub metadata: CargoTomlMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
#[serde(rename_all = "kebab-case")]
pub struct CargoTomlMetadata {
    pub singleton: Option<Config>,
}

impl Config {
    pub fn from_dir(cwd: &Path) -> anyhow::Result<Option<Self>> {
        for file in find_project_files(cwd, SUPPORTED_FILE_NAMES) {
            if let Some(config) = Self::from_file(&file)? {
                return Ok(Some(config));
            }
        }

        Ok(None)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Option<Self>> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("could not read config at `{}`", path.display()))?;

        let config = if path.file_name() == Some(OsStr::new("Cargo.toml")) {
            toml::from_str::<CargoTomlConfig>(&s)
                .with_context(|| format!("could not parse config at `{}`", path.display()))?
                .package
                .metadata
                .singleton
        } else {
            Self::from_toml(&s)
                .map(Some)
                .with_context(|| format!("could not parse config at `{}`", path.display()))?
        };

        if config.is_some() {
            log::debug!("loaded config from `{}`", path.display());
        }

        Ok(config)
    }

    pub fn from_toml(data: &str) -> anyhow::Result<Self> {
        toml::from_str(data).map_err(Into::into)
    }

    pub fn from_defaults() -> Self {
        Self {
            probe: ProbeConfig::from_defaults(),
        }
    }

    pub fn update(&mut self, source: &Self) {
        self.probe.update(&source.probe);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
#[serde(default)]
#[serde(rename_all = "kebab-case")]
pub struct ProbeConfig {
    /// Number of workers racing for the instance.
    pub threads: Option<usize>,

    /// Number of times each worker fetches the instance.
    pub calls: Option<usize>,

    /// How workers are run.
    pub strategy: Option<Strategy>,
}

impl ProbeConfig {
    pub fn from_defaults() -> Self {
        let empty = Self::default();
        Self {
            threads: Some(empty.threads()),
            calls: Some(empty.calls()),
            strategy: Some(empty.strategy()),
        }
    }

    pub fn update(&mut self, source: &Self) {
        if let Some(source) = source.threads {
            self.threads = Some(source);
        }
        if let Some(source) = source.calls {
            self.calls = Some(source);
        }
        if let Some(source) = source.strategy {
            self.strategy = Some(source);
        }
    }

    pub fn threads(&self) -> usize {
        self.threads.unwrap_or(DEFAULT_THREADS)
    }

    pub fn calls(&self) -> usize {
        self.calls.unwrap_or(DEFAULT_CALLS)
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy.unwrap_or_default()
    }
}

fn find_project_files<'a>(
    dir: &'a Path,
    names: &'a [&'a str],
) -> impl Iterator<Item = PathBuf> + 'a {
    names
        .iter()
        .map(|name| dir.join(name))
        .filter(|path| path.exists())
}
