//! Applies activities to the skill store.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use super::{ConfidencePolicy, InferenceItemError, combine, extract_evidence, summarize};
use crate::domain::{Activity, EvidenceEntry, OwnerId, SkillEvidence, SkillRecord, SkillSource};
use crate::locks::KeyedLocks;
use crate::store::{SkillStore, StoreError};

/// Result of one [`SkillInferenceEngine::apply`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferenceOutcome {
    /// Activities whose evidence was extracted and stored without error.
    pub activities_processed: usize,
    /// Ledger entries that were new.
    pub evidence_recorded: usize,
    /// Skills whose records changed, sorted by name.
    pub skills_touched: Vec<String>,
    pub errors: Vec<InferenceItemError>,
}

impl InferenceOutcome {
    /// The first storage failure, if any write to the skill store failed.
    pub fn storage_failure(&self) -> Option<&InferenceItemError> {
        self.errors
            .iter()
            .find(|e| matches!(e, InferenceItemError::Storage { .. }))
    }
}

pub struct SkillInferenceEngine {
    store: Arc<dyn SkillStore>,
    policy: ConfidencePolicy,
    locks: KeyedLocks<(OwnerId, String)>,
}

impl SkillInferenceEngine {
    pub fn new(store: Arc<dyn SkillStore>, policy: ConfidencePolicy) -> Self {
        Self {
            store,
            policy,
            locks: KeyedLocks::new(),
        }
    }

    pub fn policy(&self) -> &ConfidencePolicy {
        &self.policy
    }

    /// Records the activities' evidence and rescores every skill that gained
    /// new evidence, or whose stored records lag behind the ledger after an
    /// earlier failed write. Replaying activities already applied changes
    /// nothing.
    #[instrument(skip_all, fields(owner_id = %owner_id, activities = activities.len()))]
    pub async fn apply(
        &self,
        owner_id: OwnerId,
        activities: &[Activity],
        as_of: DateTime<Utc>,
    ) -> InferenceOutcome {
        let mut outcome = InferenceOutcome::default();
        let mut by_skill: BTreeMap<String, Vec<EvidenceEntry>> = BTreeMap::new();
        let mut extracted: Vec<Vec<String>> = Vec::with_capacity(activities.len());

        for activity in activities {
            if activity.owner_id != owner_id {
                outcome.errors.push(InferenceItemError::OwnerMismatch {
                    activity_key: activity.key(),
                    expected: owner_id,
                    actual: activity.owner_id,
                });
                continue;
            }
            match extract_evidence(activity) {
                Ok(entries) => {
                    extracted.push(entries.iter().map(|e| e.skill_name.clone()).collect());
                    for entry in entries {
                        by_skill
                            .entry(entry.skill_name.clone())
                            .or_default()
                            .push(entry);
                    }
                }
                Err(error) => {
                    debug!(error = %error, "Skipping activity");
                    outcome.errors.push(error);
                }
            }
        }

        let mut failed: HashSet<String> = HashSet::new();
        for (skill_name, entries) in by_skill {
            let _guard = self.locks.lock(&(owner_id, skill_name.clone())).await;

            let inserted = match self.store.record_evidence(&entries).await {
                Ok(inserted) => inserted,
                Err(error) => {
                    outcome.errors.push(storage_error(&skill_name, &error));
                    failed.insert(skill_name);
                    continue;
                }
            };
            outcome.evidence_recorded += inserted;

            match self.rescore(owner_id, &skill_name, as_of, inserted > 0).await {
                Ok(true) => outcome.skills_touched.push(skill_name),
                Ok(false) => {}
                Err(error) => {
                    outcome.errors.push(storage_error(&skill_name, &error));
                    failed.insert(skill_name);
                }
            }
        }

        outcome.activities_processed = extracted
            .iter()
            .filter(|skills| skills.iter().all(|s| !failed.contains(s)))
            .count();
        outcome
    }

    /// Recomputes every source's record for one skill from the full ledger.
    /// Without new evidence the records are only rewritten when they disagree
    /// with the ledger. Returns whether any record changed. Callers hold the
    /// skill's lock.
    async fn rescore(
        &self,
        owner_id: OwnerId,
        skill_name: &str,
        as_of: DateTime<Utc>,
        gained_evidence: bool,
    ) -> Result<bool, StoreError> {
        let ledger = self.store.evidence_for(owner_id, skill_name).await?;
        let evidence = summarize(&ledger);
        let existing = self.store.find_skill(owner_id, skill_name).await?;

        if !gained_evidence && records_match_ledger(&evidence, &existing) {
            return Ok(false);
        }
        if !gained_evidence {
            debug!(skill = skill_name, "Stored records lag the ledger; rebuilding");
        }

        let mut changed = false;
        for source in sources(&evidence) {
            let current = existing.iter().find(|r| r.source == source);
            let Some(record) = combine(source, &evidence, current, as_of, &self.policy) else {
                continue;
            };
            if current.is_some_and(|c| c.same_score(&record)) {
                continue;
            }
            self.store.upsert(&record).await?;
            changed = true;
        }
        Ok(changed)
    }
}

fn sources(evidence: &[SkillEvidence]) -> impl Iterator<Item = SkillSource> + '_ {
    evidence
        .iter()
        .map(|e| SkillSource::Provider(e.provider))
        .chain(std::iter::once(SkillSource::Aggregate))
}

/// Every source has a record counting exactly the ledger's evidence.
fn records_match_ledger(evidence: &[SkillEvidence], records: &[SkillRecord]) -> bool {
    if evidence.is_empty() {
        return true;
    }
    sources(evidence).all(|source| {
        let expected: u64 = evidence
            .iter()
            .filter(|e| match source {
                SkillSource::Provider(provider) => e.provider == provider,
                SkillSource::Aggregate => true,
            })
            .map(|e| e.occurrence_count)
            .sum();
        records
            .iter()
            .any(|r| r.source == source && r.evidence_count == expected)
    })
}

fn storage_error(skill_name: &str, error: &StoreError) -> InferenceItemError {
    warn!(skill = skill_name, error = %error, "Skill store write failed");
    InferenceItemError::Storage {
        skill_name: skill_name.to_string(),
        message: error.to_string(),
    }
}
