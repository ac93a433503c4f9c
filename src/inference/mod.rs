//! Skill inference
//!
//! Turns activities into evidence ledger entries and scores skill records from
//! the accumulated evidence. Everything here except [`engine`] is pure.

pub mod catalog;
pub mod engine;
pub mod policy;

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::domain::{
    Activity, ActivityKind, EvidenceEntry, OwnerId, Provider, SkillCategory, SkillEvidence,
    SkillLevel, SkillRecord, SkillSource,
};

pub use engine::{InferenceOutcome, SkillInferenceEngine};
pub use policy::ConfidencePolicy;

use catalog::{
    COLLABORATION_SKILL, ISSUE_TRACKING_SKILL, canonical_language, language_for_path,
    skill_for_label,
};
use policy::{ADVANCED_THRESHOLD, EXPERT_THRESHOLD, INTERMEDIATE_THRESHOLD, weight_for};

/// A failure that affects one activity or one skill, never the whole pass.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InferenceItemError {
    #[error("activity {activity_key} is missing attribute '{attribute}'")]
    MissingAttribute {
        activity_key: String,
        attribute: &'static str,
    },
    #[error("activity {activity_key} has malformed attribute '{attribute}'")]
    MalformedAttribute {
        activity_key: String,
        attribute: &'static str,
    },
    #[error("activity {activity_key} belongs to owner {actual}, not {expected}")]
    OwnerMismatch {
        activity_key: String,
        expected: OwnerId,
        actual: OwnerId,
    },
    #[error("failed to store evidence for skill '{skill_name}': {message}")]
    Storage { skill_name: String, message: String },
}

fn entry(activity: &Activity, skill_name: &str, category: SkillCategory) -> EvidenceEntry {
    EvidenceEntry {
        owner_id: activity.owner_id,
        skill_name: skill_name.to_string(),
        category,
        provider: activity.provider,
        activity_key: activity.key(),
        observed_at: activity.occurred_at,
        weight: weight_for(activity.kind),
    }
}

/// Reads an optional list of strings. Lists of `{"name": ..}` objects are
/// accepted as well.
fn string_attribute(
    activity: &Activity,
    attribute: &'static str,
) -> Result<Option<Vec<String>>, InferenceItemError> {
    let Some(value) = activity.attribute(attribute) else {
        return Ok(None);
    };
    if value.is_null() {
        return Ok(None);
    }
    let malformed = || InferenceItemError::MalformedAttribute {
        activity_key: activity.key(),
        attribute,
    };
    let items = value.as_array().ok_or_else(malformed)?;
    items
        .iter()
        .map(|item| match item {
            Value::String(s) => Some(s.clone()),
            Value::Object(map) => map.get("name").and_then(Value::as_str).map(str::to_string),
            _ => None,
        })
        .collect::<Option<Vec<String>>>()
        .map(Some)
        .ok_or_else(malformed)
}

/// Evidence entries produced by one activity.
pub fn extract_evidence(activity: &Activity) -> Result<Vec<EvidenceEntry>, InferenceItemError> {
    match activity.kind {
        ActivityKind::LanguageUsage => {
            let value =
                activity
                    .attribute("language")
                    .ok_or(InferenceItemError::MissingAttribute {
                        activity_key: activity.key(),
                        attribute: "language",
                    })?;
            let language = value
                .as_str()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .ok_or(InferenceItemError::MalformedAttribute {
                    activity_key: activity.key(),
                    attribute: "language",
                })?;
            Ok(vec![entry(
                activity,
                &canonical_language(language),
                SkillCategory::Language,
            )])
        }
        ActivityKind::CodeChange => {
            let languages: BTreeSet<String> = match string_attribute(activity, "files")? {
                Some(files) => files
                    .iter()
                    .filter_map(|path| language_for_path(path))
                    .map(str::to_string)
                    .collect(),
                None => string_attribute(activity, "languages")?
                    .ok_or(InferenceItemError::MissingAttribute {
                        activity_key: activity.key(),
                        attribute: "files",
                    })?
                    .iter()
                    .map(|l| canonical_language(l))
                    .filter(|l| !l.is_empty())
                    .collect(),
            };
            Ok(languages
                .iter()
                .map(|language| entry(activity, language, SkillCategory::Language))
                .collect())
        }
        ActivityKind::Message => Ok(vec![entry(
            activity,
            COLLABORATION_SKILL,
            SkillCategory::Collaboration,
        )]),
        ActivityKind::Issue => {
            let mut named = string_attribute(activity, "labels")?.unwrap_or_default();
            named.extend(string_attribute(activity, "components")?.unwrap_or_default());

            let mut seen = HashSet::new();
            let mut entries: Vec<EvidenceEntry> = named
                .iter()
                .filter_map(|label| skill_for_label(label))
                .filter(|(skill, _)| seen.insert(*skill))
                .map(|(skill, category)| entry(activity, skill, category))
                .collect();
            entries.push(entry(activity, ISSUE_TRACKING_SKILL, SkillCategory::Practice));
            Ok(entries)
        }
    }
}

/// Groups ledger entries by `(owner, skill, provider)`. Entries repeating an
/// activity key count once.
pub fn summarize(entries: &[EvidenceEntry]) -> Vec<SkillEvidence> {
    let mut groups: BTreeMap<(OwnerId, String, Provider), SkillEvidence> = BTreeMap::new();
    let mut seen: HashSet<(OwnerId, &str, Provider, &str)> = HashSet::new();

    for e in entries {
        if !seen.insert((e.owner_id, &e.skill_name, e.provider, &e.activity_key)) {
            continue;
        }
        groups
            .entry((e.owner_id, e.skill_name.clone(), e.provider))
            .and_modify(|summary| {
                summary.occurrence_count += 1;
                summary.weight += e.weight;
                summary.last_observed_at = summary.last_observed_at.max(e.observed_at);
            })
            .or_insert_with(|| SkillEvidence {
                owner_id: e.owner_id,
                skill_name: e.skill_name.clone(),
                category: e.category,
                provider: e.provider,
                occurrence_count: 1,
                last_observed_at: e.observed_at,
                weight: e.weight,
            });
    }

    groups.into_values().collect()
}

/// Extracts and summarizes a batch, collecting per-activity failures.
pub fn infer_evidence(activities: &[Activity]) -> (Vec<SkillEvidence>, Vec<InferenceItemError>) {
    let mut entries = Vec::new();
    let mut errors = Vec::new();
    for activity in activities {
        match extract_evidence(activity) {
            Ok(mut extracted) => entries.append(&mut extracted),
            Err(error) => errors.push(error),
        }
    }
    (summarize(&entries), errors)
}

/// `strength × recency` for one provider's evidence, clamped to `[0, 1]`.
pub fn confidence(evidence: &SkillEvidence, as_of: DateTime<Utc>, policy: &ConfidencePolicy) -> f64 {
    let scale = policy.saturation_scale.max(f64::EPSILON);
    let strength = 1.0 - (-evidence.weight.max(0.0) / scale).exp();

    let days_since = (as_of - evidence.last_observed_at).num_days().max(0);
    let recency = if days_since <= policy.staleness_threshold_days {
        1.0
    } else {
        let overdue = (days_since - policy.staleness_threshold_days) as f64;
        let window = policy.decay_window_days.max(1) as f64;
        let floor = policy.min_recency_factor.clamp(0.0, 1.0);
        (1.0 - (1.0 - floor) * overdue / window).max(floor)
    };

    (strength * recency).clamp(0.0, 1.0)
}

pub fn level_for(confidence: f64) -> SkillLevel {
    if confidence >= EXPERT_THRESHOLD {
        SkillLevel::Expert
    } else if confidence >= ADVANCED_THRESHOLD {
        SkillLevel::Advanced
    } else if confidence >= INTERMEDIATE_THRESHOLD {
        SkillLevel::Intermediate
    } else {
        SkillLevel::Beginner
    }
}

/// Scores the record for `source` from one skill's per-provider evidence.
///
/// Returns `None` when there is no evidence for the source. When the score
/// matches `existing`, `existing` is returned unchanged, including its
/// `last_updated_at`.
pub fn combine(
    source: SkillSource,
    evidence: &[SkillEvidence],
    existing: Option<&SkillRecord>,
    as_of: DateTime<Utc>,
    policy: &ConfidencePolicy,
) -> Option<SkillRecord> {
    let relevant: Vec<&SkillEvidence> = match source {
        SkillSource::Provider(provider) => {
            evidence.iter().filter(|e| e.provider == provider).collect()
        }
        SkillSource::Aggregate => evidence.iter().collect(),
    };
    let first = relevant.first()?;

    let confidence = match source {
        SkillSource::Provider(_) => relevant
            .iter()
            .map(|e| confidence(e, as_of, policy))
            .fold(0.0, f64::max),
        SkillSource::Aggregate => {
            let miss: f64 = relevant
                .iter()
                .map(|e| 1.0 - confidence(e, as_of, policy))
                .product();
            (1.0 - miss).clamp(0.0, 1.0)
        }
    };

    let record = SkillRecord {
        owner_id: first.owner_id,
        skill_name: first.skill_name.clone(),
        category: first.category,
        level: level_for(confidence),
        confidence,
        source,
        evidence_count: relevant.iter().map(|e| e.occurrence_count).sum(),
        last_observed_at: relevant
            .iter()
            .map(|e| e.last_observed_at)
            .max()
            .unwrap_or(first.last_observed_at),
        last_updated_at: as_of,
    };

    match existing {
        Some(current) if current.same_score(&record) => Some(current.clone()),
        _ => Some(record),
    }
}
