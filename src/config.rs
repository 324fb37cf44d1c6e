use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::filter::FilterPreset;

/// Settings for a filter run, read from an optional JSON file.
///
/// ```json
/// { "filter": "mono", "intensity": 0.8 }
/// ```
///
/// Missing fields take their defaults (sepia at full intensity).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub filter: FilterPreset,
    pub intensity: f32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            filter: FilterPreset::Sepia,
            intensity: 1.0,
        }
    }
}

impl AppConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: AppConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `path`, or returns the defaults when no file is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config =
            Self::from_json(&json).with_context(|| format!("parse config {}", path.display()))?;
        log::debug!("loaded {:?} from {}", config, path.display());
        Ok(config)
    }

    /// Command line values win over the file.
    pub fn with_overrides(
        mut self,
        filter: Option<FilterPreset>,
        intensity: Option<f32>,
    ) -> anyhow::Result<Self> {
        if let Some(filter) = filter {
            self.filter = filter;
        }
        if let Some(intensity) = intensity {
            self.intensity = intensity;
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.intensity) {
            anyhow::bail!("intensity must be within 0.0..=1.0, got {}", self.intensity);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_json("{}").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.filter, FilterPreset::Sepia);
        assert_eq!(config.intensity, 1.0);
    }

    #[test]
    fn test_overrides_win() {
        let config = AppConfig::from_json(r#"{ "filter": "mono", "intensity": 0.5 }"#)
            .unwrap()
            .with_overrides(Some(FilterPreset::Invert), None)
            .unwrap();
        assert_eq!(config.filter, FilterPreset::Invert);
        assert_eq!(config.intensity, 0.5);
    }

    #[test]
    fn test_rejects_bad_values() {
        let err = AppConfig::from_json(r#"{ "filter": "vintage" }"#).unwrap_err();
        assert!(err.to_string().contains("sepia"), "{}", err);

        assert!(AppConfig::from_json(r#"{ "intensity": 1.5 }"#).is_err());
        assert!(AppConfig::default()
            .with_overrides(None, Some(-0.1))
            .is_err());
    }

    #[test]
    fn test_load_file() {
        assert_eq!(AppConfig::load(None).unwrap(), AppConfig::default());

        let path = std::env::temp_dir().join(format!("{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, r#"{ "filter": "invert" }"#).unwrap();
        let config = AppConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.filter, FilterPreset::Invert);

        assert!(AppConfig::load(Some(&path)).is_err());
    }
}
