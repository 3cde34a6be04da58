//! Startup configuration, loaded once from TOML and immutable afterwards.

use std::collections::BTreeMap;
use std::path::Path;

use h3o::Resolution;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::{CategoryId, Location};

const SECONDS_PER_DAY: f64 = 86_400.0;
/// Roughly the span of `chrono::DateTime<Utc>`; anything longer keeps every
/// representable incident anyway.
const MAX_RETENTION_DAYS: f64 = 200_000_000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// λ: seconds of travel time traded for one unit of accumulated risk.
    pub risk_aversion: f64,
    /// H3 resolution of the risk grid cells.
    pub resolution: u8,
    /// Incidents older than this are excluded from every query.
    pub retention_days: f64,
    /// Number of independently locked incident shards.
    pub shard_count: usize,
    /// Largest region, in grid cells, a heatmap or incident search may cover.
    pub max_region_cells: usize,
    pub default_half_life_days: f64,
    pub bounds: Option<BoundsConfig>,
    pub categories: BTreeMap<CategoryId, CategoryConfig>,
    pub safety: SafetyConfig,
    pub routing: RoutingConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CategoryConfig {
    /// Falls back to `default_half_life_days`.
    pub half_life_days: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundsConfig {
    pub min: Location,
    pub max: Location,
}

impl BoundsConfig {
    pub fn contains(&self, location: Location) -> bool {
        (self.min.lat..=self.max.lat).contains(&location.lat)
            && (self.min.lng..=self.max.lng).contains(&location.lng)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Risk per kilometer at or below which a route is Safe.
    pub safe_threshold: f64,
    /// Risk per kilometer at or below which a route is Moderate.
    pub risky_threshold: f64,
    /// Lower bound on the distance used for density, in kilometers.
    pub min_distance_km: f64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            safe_threshold: 0.5,
            risky_threshold: 2.0,
            min_distance_km: 0.05,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Used to derive travel time for graphs imported from OSM.
    pub walking_speed_mps: f64,
    /// Enables the straight-line A* heuristic. Must bound the fastest edge.
    pub max_speed_mps: Option<f64>,
    pub default_timeout_ms: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            walking_speed_mps: 1.4,
            max_speed_mps: None,
            default_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        let categories = [
            ("thefts", 30.0),
            ("accidents", 14.0),
            ("assaults", 90.0),
            ("vandalism", 7.0),
        ]
        .into_iter()
        .map(|(id, days)| {
            (
                CategoryId::from(id),
                CategoryConfig {
                    half_life_days: Some(days),
                },
            )
        })
        .collect();

        Self {
            risk_aversion: 60.0,
            resolution: 9,
            retention_days: 365.0,
            shard_count: 16,
            max_region_cells: 200_000,
            default_half_life_days: 30.0,
            bounds: None,
            categories,
            safety: SafetyConfig::default(),
            routing: RoutingConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Reads and validates a TOML configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed, or fails
    /// validation.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError`] if the text is not valid TOML or fails
    /// validation.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns the first invalid setting found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.risk_aversion.is_finite() || self.risk_aversion < 0.0 {
            return Err(ConfigError::RiskAversion(self.risk_aversion));
        }
        self.h3_resolution()?;

        require_positive("retention_days", self.retention_days)?;
        self.retention()?;
        require_positive("default_half_life_days", self.default_half_life_days)?;
        if self.shard_count == 0 {
            return Err(ConfigError::NotPositive {
                name: "shard_count".to_string(),
                value: 0.0,
            });
        }
        if self.max_region_cells == 0 {
            return Err(ConfigError::NotPositive {
                name: "max_region_cells".to_string(),
                value: 0.0,
            });
        }
        for (id, category) in &self.categories {
            if let Some(days) = category.half_life_days {
                require_positive(&format!("categories.{id}.half_life_days"), days)?;
            }
        }

        if let Some(bounds) = &self.bounds {
            if !bounds.min.is_valid() || !bounds.max.is_valid() {
                return Err(ConfigError::Bounds("corner is not a valid coordinate".to_string()));
            }
            if bounds.min.lat > bounds.max.lat || bounds.min.lng > bounds.max.lng {
                return Err(ConfigError::Bounds("min corner exceeds max corner".to_string()));
            }
        }

        let SafetyConfig {
            safe_threshold: safe,
            risky_threshold: risky,
            min_distance_km,
        } = self.safety;
        if !safe.is_finite() || !risky.is_finite() || safe < 0.0 || safe >= risky {
            return Err(ConfigError::Thresholds { safe, risky });
        }
        require_positive("safety.min_distance_km", min_distance_km)?;

        require_positive("routing.walking_speed_mps", self.routing.walking_speed_mps)?;
        if let Some(speed) = self.routing.max_speed_mps {
            require_positive("routing.max_speed_mps", speed)?;
        }

        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Resolution`] for values above 15.
    pub fn h3_resolution(&self) -> Result<Resolution, ConfigError> {
        Resolution::try_from(self.resolution).map_err(|_| ConfigError::Resolution(self.resolution))
    }

    pub fn half_life_secs(&self, category: &CategoryId) -> f64 {
        self.categories
            .get(category)
            .and_then(|c| c.half_life_days)
            .unwrap_or(self.default_half_life_days)
            * SECONDS_PER_DAY
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Retention`] if the horizon does not fit in a
    /// `chrono::Duration`.
    pub fn retention(&self) -> Result<chrono::Duration, ConfigError> {
        if !self.retention_days.is_finite() || self.retention_days > MAX_RETENTION_DAYS {
            return Err(ConfigError::Retention(self.retention_days));
        }
        // Sub-second precision is irrelevant for retention.
        let secs = (self.retention_days * SECONDS_PER_DAY) as i64;
        chrono::Duration::try_seconds(secs).ok_or(ConfigError::Retention(self.retention_days))
    }
}

fn require_positive(name: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NotPositive {
            name: name.to_string(),
            value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_config_is_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            risk_aversion = 2.5
            resolution = 10

            [categories.assaults]
            half_life_days = 120.0

            [safety]
            safe_threshold = 1.0
            risky_threshold = 3.0
            "#,
        )
        .unwrap();

        assert_eq!(config.risk_aversion, 2.5);
        assert_eq!(config.resolution, 10);
        assert_eq!(config.safety.min_distance_km, 0.05);
        assert_eq!(config.half_life_secs(&"assaults".into()), 120.0 * SECONDS_PER_DAY);
        assert_eq!(config.half_life_secs(&"unlisted".into()), 30.0 * SECONDS_PER_DAY);
    }

    #[test]
    fn rejects_non_monotonic_thresholds() {
        let mut config = EngineConfig::default();
        config.safety.safe_threshold = 2.0;
        config.safety.risky_threshold = 2.0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::Thresholds {
                safe: 2.0,
                risky: 2.0
            })
        );
    }

    #[test]
    fn rejects_negative_risk_aversion() {
        let config = EngineConfig {
            risk_aversion: -1.0,
            ..EngineConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::RiskAversion(-1.0)));
    }

    #[test]
    fn rejects_bad_resolution() {
        let config = EngineConfig {
            resolution: 16,
            ..EngineConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Resolution(16)));
    }

    #[test]
    fn example_config_parses() {
        let config = EngineConfig::from_toml_str(include_str!("../safewalk.example.toml")).unwrap();
        assert_eq!(config.categories.len(), 4);
        assert!(config.bounds.is_some());
    }

    #[test]
    fn default_categories_are_the_front_end_layer_ids() {
        let config = EngineConfig::default();
        let ids: Vec<&str> = config
            .categories
            .keys()
            .map(CategoryId::as_str)
            .collect();
        assert_eq!(ids, vec!["accidents", "assaults", "thefts", "vandalism"]);
    }

    #[test]
    fn retention_beyond_the_calendar_is_rejected() {
        let config = EngineConfig {
            retention_days: 1e20,
            ..EngineConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Retention(1e20)));

        let long = EngineConfig {
            retention_days: 1e8,
            ..EngineConfig::default()
        };
        assert_eq!(long.retention().unwrap(), chrono::Duration::days(100_000_000));
    }

    #[test]
    fn bounds_are_inclusive() {
        let bounds = BoundsConfig {
            min: Location::new(28.0, 77.0),
            max: Location::new(29.0, 78.0),
        };
        assert!(bounds.contains(Location::new(28.0, 77.5)));
        assert!(!bounds.contains(Location::new(29.5, 77.5)));
    }
}
