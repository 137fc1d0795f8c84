//! Run configuration, stored as TOML.
//!
//! Every field has a default so a configuration file only needs the values that differ.

use crate::engine::{SusieRssEngine, SusieSettings};
use crate::ld::{
    DEFAULT_PREFIX_TEMPLATE, LdProvider, PlinkLdProvider, PrecomputedLdProvider, ReferencePanel,
};
use crate::leads::LeadOptions;
use crate::select::{LSelection, SearchSettings};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_WINDOW_KB: u64 = 500;
pub const DEFAULT_POPULATION: &str = "EUR";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("No LD source configured: set a reference directory or a precomputed LD matrix with its variant list.")]
    NoLdSource,
    #[error("A precomputed LD matrix needs both the matrix file and its variant list.")]
    IncompletePrecomputedLd,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionSettings {
    /// Radius of the fine-mapping window around the lead, in kilobases.
    pub window_kb: u64,
}

impl Default for RegionSettings {
    fn default() -> Self {
        Self {
            window_kb: DEFAULT_WINDOW_KB,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LdSettings {
    pub plink: PathBuf,
    pub reference_dir: Option<PathBuf>,
    pub population: String,
    pub prefix_template: String,
    pub timeout_secs: Option<u64>,
    /// Precomputed matrix; takes precedence over the reference panel when set.
    pub matrix: Option<PathBuf>,
    pub variants: Option<PathBuf>,
}

impl Default for LdSettings {
    fn default() -> Self {
        Self {
            plink: PathBuf::from("plink2"),
            reference_dir: None,
            population: DEFAULT_POPULATION.to_string(),
            prefix_template: DEFAULT_PREFIX_TEMPLATE.to_string(),
            timeout_secs: None,
            matrix: None,
            variants: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Number of effects; `<= 0` searches for it.
    pub l: i64,
    #[serde(flatten)]
    pub search: SearchSettings,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            l: -1,
            search: SearchSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FineMapConfig {
    pub sample_size: Option<u64>,
    pub require_convergence: bool,
    pub region: RegionSettings,
    pub ld: LdSettings,
    pub engine: SusieSettings,
    pub search: ModelSettings,
    pub leads: LeadOptions,
}

impl FineMapConfig {
    /// Saves the configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Loads a configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config = toml::from_str(&toml_string)?;
        Ok(config)
    }

    pub fn selection(&self) -> LSelection {
        LSelection::from_requested(self.search.l, self.search.search)
    }

    pub fn panel(&self) -> ReferencePanel {
        ReferencePanel::new(
            self.ld.reference_dir.clone().unwrap_or_default(),
            self.ld.population.clone(),
        )
        .with_prefix_template(self.ld.prefix_template.clone())
    }

    /// The LD source implied by the settings: a precomputed matrix when one is configured,
    /// PLINK against the reference directory otherwise.
    pub fn ld_provider(&self) -> Result<Box<dyn LdProvider>, ConfigError> {
        match (&self.ld.matrix, &self.ld.variants) {
            (Some(matrix), Some(variants)) => {
                Ok(Box::new(PrecomputedLdProvider::new(matrix, variants)))
            }
            (Some(_), None) | (None, Some(_)) => Err(ConfigError::IncompletePrecomputedLd),
            (None, None) => {
                if self.ld.reference_dir.is_none() {
                    return Err(ConfigError::NoLdSource);
                }
                Ok(Box::new(
                    PlinkLdProvider::new(&self.ld.plink)
                        .with_timeout(self.ld.timeout_secs.map(Duration::from_secs)),
                ))
            }
        }
    }

    pub fn engine(&self) -> SusieRssEngine {
        SusieRssEngine::new(self.engine.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_reference_behaviour() {
        let config = FineMapConfig::default();
        assert_eq!(config.region.window_kb, 500);
        assert_eq!(config.search.l, -1);
        assert_eq!(config.search.search.l_max, 20);
        assert_eq!(config.search.search.trials, 10);
        assert_eq!(config.engine.coverage, 0.95);
        assert_eq!(config.engine.min_abs_corr, 0.5);
        assert_eq!(config.engine.seed, 42);
        assert!(!config.require_convergence);
        assert!(matches!(config.selection(), LSelection::Search(_)));
    }

    #[test]
    fn partial_files_fill_in_defaults() {
        let config: FineMapConfig = toml::from_str(
            r#"
            require_convergence = true

            [search]
            l = 3
            trials = 4

            [ld]
            reference_dir = "/data/1kg"
            population = "AFR"
            "#,
        )
        .unwrap();
        assert!(config.require_convergence);
        assert_eq!(config.selection(), LSelection::Fixed(3));
        assert_eq!(config.search.search.trials, 4);
        assert_eq!(config.search.search.l_max, 20);
        assert_eq!(config.region.window_kb, 500);
        assert_eq!(
            config.panel().bfile_prefix(crate::types::Chromosome::Autosome(2)),
            PathBuf::from("/data/1kg/AFR/AFR.2")
        );
    }

    #[test]
    fn save_and_load_preserve_settings() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("finemap.toml");
        let mut config = FineMapConfig::default();
        config.sample_size = Some(12_345);
        config.ld.timeout_secs = Some(600);
        config.search.search.parallel = true;
        config.save(&path).unwrap();

        assert_eq!(FineMapConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn ld_source_must_be_configured() {
        let mut config = FineMapConfig::default();
        assert!(matches!(config.ld_provider(), Err(ConfigError::NoLdSource)));

        config.ld.matrix = Some(PathBuf::from("ld.txt"));
        assert!(matches!(
            config.ld_provider(),
            Err(ConfigError::IncompletePrecomputedLd)
        ));

        config.ld.variants = Some(PathBuf::from("ld.vars"));
        assert!(config.ld_provider().is_ok());
    }
}
