use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::SafetyConfig;
use crate::error::ConfigError;

/// Ordered from safest to riskiest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SafetyRating {
    Safe,
    Moderate,
    Risky,
}

impl SafetyRating {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Safe => "Safe",
            Self::Moderate => "Moderate",
            Self::Risky => "Risky",
        }
    }
}

impl fmt::Display for SafetyRating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a route's risk per kilometer onto a [`SafetyRating`].
///
/// Bands are `[0, safe]`, `(safe, risky]` and `(risky, ∞)`: a density equal
/// to a threshold lands in the safer band.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SafetyScorer {
    safe_threshold: f64,
    risky_threshold: f64,
    min_distance_km: f64,
}

impl SafetyScorer {
    /// # Errors
    ///
    /// Returns [`ConfigError`] unless `0 <= safe < risky` and the minimum
    /// distance is positive.
    pub fn new(config: &SafetyConfig) -> Result<Self, ConfigError> {
        let (safe, risky) = (config.safe_threshold, config.risky_threshold);
        if !safe.is_finite() || !risky.is_finite() || safe < 0.0 || safe >= risky {
            return Err(ConfigError::Thresholds { safe, risky });
        }
        if !config.min_distance_km.is_finite() || config.min_distance_km <= 0.0 {
            return Err(ConfigError::NotPositive {
                name: "safety.min_distance_km".to_string(),
                value: config.min_distance_km,
            });
        }
        Ok(Self {
            safe_threshold: safe,
            risky_threshold: risky,
            min_distance_km: config.min_distance_km,
        })
    }

    pub fn density(&self, total_risk: f64, total_distance_m: f64) -> f64 {
        total_risk / (total_distance_m / 1_000.0).max(self.min_distance_km)
    }

    /// Total over all inputs; NaN is treated as the riskiest band.
    pub fn band(&self, density: f64) -> SafetyRating {
        if density <= self.safe_threshold {
            SafetyRating::Safe
        } else if density <= self.risky_threshold {
            SafetyRating::Moderate
        } else {
            SafetyRating::Risky
        }
    }

    pub fn rate(&self, total_risk: f64, total_distance_m: f64) -> SafetyRating {
        self.band(self.density(total_risk, total_distance_m))
    }
}

/// One-line description for the presentation layer, e.g.
/// `Safe route: 2.4 km, about 8 minutes`.
pub fn summarize(rating: SafetyRating, distance_m: f64, duration_s: f64) -> String {
    if distance_m <= 0.0 {
        return format!("{rating} route: already at the destination");
    }

    let distance = if distance_m < 1_000.0 {
        format!("{distance_m:.0} m")
    } else {
        format!("{:.1} km", distance_m / 1_000.0)
    };

    let minutes = (duration_s / 60.0).round();
    let duration = if minutes < 1.0 {
        "under a minute".to_string()
    } else if (minutes - 1.0).abs() < f64::EPSILON {
        "about 1 minute".to_string()
    } else {
        format!("about {minutes:.0} minutes")
    };

    format!("{rating} route: {distance}, {duration}")
}
