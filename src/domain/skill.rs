//! Skill evidence and skill records.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::{OwnerId, Provider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SkillLevel {
    Beginner,
    Intermediate,
    Advanced,
    Expert,
}

impl SkillLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkillLevel::Beginner => "beginner",
            SkillLevel::Intermediate => "intermediate",
            SkillLevel::Advanced => "advanced",
            SkillLevel::Expert => "expert",
        }
    }
}

impl FromStr for SkillLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "beginner" => Ok(SkillLevel::Beginner),
            "intermediate" => Ok(SkillLevel::Intermediate),
            "advanced" => Ok(SkillLevel::Advanced),
            "expert" => Ok(SkillLevel::Expert),
            other => Err(format!("unknown skill level '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SkillCategory {
    /// Programming language.
    Language,
    /// Framework, platform or tool.
    Technology,
    /// Engineering practice such as issue tracking.
    Practice,
    /// Communication and teamwork.
    Collaboration,
}

impl SkillCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkillCategory::Language => "language",
            SkillCategory::Technology => "technology",
            SkillCategory::Practice => "practice",
            SkillCategory::Collaboration => "collaboration",
        }
    }
}

impl FromStr for SkillCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "language" => Ok(SkillCategory::Language),
            "technology" => Ok(SkillCategory::Technology),
            "practice" => Ok(SkillCategory::Practice),
            "collaboration" => Ok(SkillCategory::Collaboration),
            other => Err(format!("unknown skill category '{other}'")),
        }
    }
}

/// Where a skill record's confidence comes from: one provider, or all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SkillSource {
    Provider(Provider),
    Aggregate,
}

impl utoipa::PartialSchema for SkillSource {
    fn schema() -> utoipa::openapi::RefOr<utoipa::openapi::schema::Schema> {
        utoipa::openapi::ObjectBuilder::new()
            .schema_type(utoipa::openapi::schema::Type::String)
            .examples([serde_json::json!("aggregate")])
            .into()
    }
}

impl ToSchema for SkillSource {}

impl SkillSource {
    pub const AGGREGATE: &'static str = "aggregate";

    pub fn as_str(&self) -> &'static str {
        match self {
            SkillSource::Provider(p) => p.slug(),
            SkillSource::Aggregate => Self::AGGREGATE,
        }
    }
}

impl fmt::Display for SkillSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SkillSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == Self::AGGREGATE {
            return Ok(SkillSource::Aggregate);
        }
        s.parse::<Provider>()
            .map(SkillSource::Provider)
            .map_err(|e| e.to_string())
    }
}

impl TryFrom<String> for SkillSource {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SkillSource> for String {
    fn from(value: SkillSource) -> Self {
        value.as_str().to_string()
    }
}

/// Ledger row: one activity's contribution to one skill.
#[derive(Debug, Clone, PartialEq)]
pub struct EvidenceEntry {
    pub owner_id: OwnerId,
    pub skill_name: String,
    pub category: SkillCategory,
    pub provider: Provider,
    pub activity_key: String,
    pub observed_at: DateTime<Utc>,
    pub weight: f64,
}

/// Evidence for one skill from one provider, summarized over activities.
#[derive(Debug, Clone, PartialEq)]
pub struct SkillEvidence {
    pub owner_id: OwnerId,
    pub skill_name: String,
    pub category: SkillCategory,
    pub provider: Provider,
    pub occurrence_count: u64,
    pub last_observed_at: DateTime<Utc>,
    pub weight: f64,
}

/// Durable, scored skill claim for one owner and one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SkillRecord {
    pub owner_id: OwnerId,
    pub skill_name: String,
    pub category: SkillCategory,
    pub level: SkillLevel,
    pub confidence: f64,
    pub source: SkillSource,
    pub evidence_count: u64,
    pub last_observed_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl SkillRecord {
    /// Compares everything except `last_updated_at`.
    pub fn same_score(&self, other: &SkillRecord) -> bool {
        self.owner_id == other.owner_id
            && self.skill_name == other.skill_name
            && self.category == other.category
            && self.level == other.level
            && self.source == other.source
            && self.evidence_count == other.evidence_count
            && self.last_observed_at == other.last_observed_at
            && (self.confidence - other.confidence).abs() < 1e-9
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skill_source_serializes_as_plain_string() {
        assert_eq!(
            serde_json::to_value(SkillSource::Aggregate).unwrap(),
            serde_json::json!("aggregate")
        );
        assert_eq!(
            serde_json::from_value::<SkillSource>(serde_json::json!("jira")).unwrap(),
            SkillSource::Provider(Provider::Jira)
        );
        assert!("nope".parse::<SkillSource>().is_err());
    }

    #[test]
    fn levels_order_by_strength() {
        assert!(SkillLevel::Beginner < SkillLevel::Intermediate);
        assert!(SkillLevel::Advanced < SkillLevel::Expert);
    }
}
