//! Scoring constants and the tunable confidence policy.

use crate::config::InferenceConfig;
use crate::domain::ActivityKind;

/// Accumulated weight at which strength reaches `1 - 1/e`.
pub const SATURATION_SCALE: f64 = 8.0;
/// Evidence younger than this keeps full recency.
pub const STALENESS_THRESHOLD_DAYS: i64 = 90;
/// Days over which recency decays linearly after the staleness threshold.
pub const DECAY_WINDOW_DAYS: i64 = 365;
pub const MIN_RECENCY_FACTOR: f64 = 0.25;

pub const INTERMEDIATE_THRESHOLD: f64 = 0.30;
pub const ADVANCED_THRESHOLD: f64 = 0.60;
pub const EXPERT_THRESHOLD: f64 = 0.85;

pub const LANGUAGE_USAGE_WEIGHT: f64 = 2.0;
pub const CODE_CHANGE_WEIGHT: f64 = 1.0;
pub const ISSUE_WEIGHT: f64 = 0.5;
pub const MESSAGE_WEIGHT: f64 = 0.25;

pub fn weight_for(kind: ActivityKind) -> f64 {
    match kind {
        ActivityKind::LanguageUsage => LANGUAGE_USAGE_WEIGHT,
        ActivityKind::CodeChange => CODE_CHANGE_WEIGHT,
        ActivityKind::Issue => ISSUE_WEIGHT,
        ActivityKind::Message => MESSAGE_WEIGHT,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidencePolicy {
    pub saturation_scale: f64,
    pub staleness_threshold_days: i64,
    pub decay_window_days: i64,
    pub min_recency_factor: f64,
}

impl Default for ConfidencePolicy {
    fn default() -> Self {
        Self {
            saturation_scale: SATURATION_SCALE,
            staleness_threshold_days: STALENESS_THRESHOLD_DAYS,
            decay_window_days: DECAY_WINDOW_DAYS,
            min_recency_factor: MIN_RECENCY_FACTOR,
        }
    }
}

impl From<&InferenceConfig> for ConfidencePolicy {
    fn from(config: &InferenceConfig) -> Self {
        Self {
            saturation_scale: config.saturation_scale,
            staleness_threshold_days: config.staleness_threshold_days,
            decay_window_days: config.decay_window_days,
            min_recency_factor: config.min_recency_factor,
        }
    }
}
