use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::Database;
use crate::error::MasteryError;
use crate::models::{
    Concept, LearnerProfile, LearningSession, MasteryLevel, MasteryRecord, Misconception, Modality,
    ModalityPreferences, NewConcept, NewMisconception, PracticeUpdate, SessionStats, SessionType,
};

pub type Result<T> = std::result::Result<T, MasteryError>;

pub const EASE_MIN: f64 = 1.3;
pub const EASE_MAX: f64 = 2.5;
pub const DEFAULT_LEARNING_RATE: f64 = 0.1;
const FIRST_REPEAT_INTERVAL_DAYS: i64 = 6;
pub const MAX_INTERVAL_DAYS: i64 = 36_500;
const DEFAULT_ESTIMATED_MINUTES: i32 = 30;
const LIST_CAP: usize = 5;
const REVIEW_POOL: usize = 500;

/// SM-2 style interval update. The interval stays inside
/// [1, MAX_INTERVAL_DAYS] and the ease factor inside [EASE_MIN, EASE_MAX].
pub fn schedule_review(record: &mut MasteryRecord, correct: bool, now: DateTime<Utc>) {
    if correct {
        record.review_interval_days = if record.review_interval_days == 1 {
            FIRST_REPEAT_INTERVAL_DAYS
        } else {
            (record.review_interval_days as f64 * record.ease_factor)
                .floor()
                .min(MAX_INTERVAL_DAYS as f64) as i64
        };
        record.ease_factor = (record.ease_factor + 0.1).min(EASE_MAX);
    } else {
        record.review_interval_days = 1;
        record.ease_factor = (record.ease_factor - 0.2).max(EASE_MIN);
    }

    record.review_interval_days = record.review_interval_days.clamp(1, MAX_INTERVAL_DAYS);
    record.next_review_at = now
        .checked_add_signed(Duration::days(record.review_interval_days))
        .unwrap_or(now);
}

/// Applies one practice event to a record. Returns true when this call is
/// the first to reach a mastered level.
pub fn apply_practice(record: &mut MasteryRecord, update: &PracticeUpdate, now: DateTime<Utc>) -> bool {
    if let Some(correct) = update.correct {
        record.attempts_count += 1;
        if correct {
            record.correct_count += 1;
        }
        record.mastery_score = record.accuracy();
        schedule_review(record, correct, now);
    }

    // Direct values win over the accuracy-derived ones
    if let Some(score) = update.direct_score {
        record.mastery_score = score.clamp(0.0, 1.0);
    }
    if let Some(confidence) = update.direct_confidence {
        record.confidence_score = confidence.clamp(0.0, 1.0);
    }

    record.mastery_level = MasteryLevel::from_score(record.mastery_score);
    record.last_practiced_at = Some(now);

    if record.mastery_level.is_mastered() && record.mastered_at.is_none() {
        record.mastered_at = Some(now);
        return true;
    }
    false
}

/// Day-granularity streak update keyed on calendar dates (UTC).
pub fn advance_streak(profile: &mut LearnerProfile, now: DateTime<Utc>) {
    match profile.last_activity_at {
        Some(last) => {
            let gap = (now.date_naive() - last.date_naive()).num_days();
            if gap == 1 {
                profile.current_streak_days += 1;
            } else if gap > 1 {
                profile.current_streak_days = 1;
            }
        }
        None => profile.current_streak_days = 1,
    }

    profile.longest_streak_days = profile.longest_streak_days.max(profile.current_streak_days);
    profile.last_activity_at = Some(now);
    profile.updated_at = now;
}

pub fn adjust_weight(weight: f64, success: bool, learning_rate: f64) -> f64 {
    let next = if success {
        (weight + learning_rate).min(1.0)
    } else {
        (weight - learning_rate / 2.0).max(0.0)
    };
    next.clamp(0.0, 1.0)
}

fn validate_unit(name: &str, value: Option<f64>) -> Result<()> {
    match value {
        Some(v) if v.is_nan() || !(0.0..=1.0).contains(&v) => Err(MasteryError::Validation(format!(
            "{} must be within [0, 1], got {}",
            name, v
        ))),
        _ => Ok(()),
    }
}

// Weighted roulette pick over non-negative weights
fn pick_weighted<R: Rng>(weights: &[f64], rng: &mut R) -> Option<usize> {
    if weights.is_empty() {
        return None;
    }

    let total_weight: f64 = weights.iter().sum();
    if total_weight <= 0.0 {
        return Some(0);
    }

    let mut random_point = rng.gen::<f64>() * total_weight;
    for (i, weight) in weights.iter().enumerate() {
        random_point -= weight;
        if random_point <= 0.0 {
            return Some(i);
        }
    }

    Some(weights.len() - 1)
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewCandidate {
    pub record: MasteryRecord,
    pub concept: Concept,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreakInfo {
    pub current: i64,
    pub longest: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Analytics {
    pub profile_id: String,
    pub overall_progress: f64,
    pub overall_mastery_score: f64,
    pub concepts_by_mastery: BTreeMap<String, i64>,
    pub subjects_progress: BTreeMap<String, f64>,
    pub top_strengths: Vec<String>,
    pub areas_for_improvement: Vec<String>,
    pub recommended_next_concepts: Vec<String>,
    /// Minutes studied per day, oldest first, today last.
    pub study_time_weekly: [i64; 7],
    pub streak_info: StreakInfo,
    pub active_misconceptions: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphNode {
    pub id: String,
    pub name: String,
    pub subject: String,
    pub topic: String,
    pub mastery_level: MasteryLevel,
    pub mastery_score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
    pub relationship: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

/// Tracks per-concept proficiency, review schedules, streaks, modality
/// preferences and misconceptions for learner profiles.
#[derive(Clone)]
pub struct MasteryEngine {
    db: Arc<Database>,
}

impl MasteryEngine {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    // Profile operations

    pub fn create_profile(&self, learner_id: &str) -> Result<LearnerProfile> {
        let learner_id = learner_id.trim();
        if learner_id.is_empty() {
            return Err(MasteryError::Validation("learner id must not be empty".into()));
        }
        if self.db.get_profile_by_learner(learner_id)?.is_some() {
            return Err(MasteryError::ProfileExists(learner_id.to_string()));
        }

        let now = Utc::now();
        let profile = LearnerProfile {
            id: Uuid::new_v4().to_string(),
            learner_id: learner_id.to_string(),
            overall_mastery_score: 0.0,
            learning_velocity: 1.0,
            retention_rate: 0.8,
            modality_preferences: ModalityPreferences::neutral(),
            total_study_time_minutes: 0,
            total_concepts_attempted: 0,
            total_concepts_mastered: 0,
            current_streak_days: 0,
            longest_streak_days: 0,
            created_at: now,
            updated_at: now,
            last_activity_at: None,
        };
        self.db.insert_profile(&profile)?;

        info!(profile_id = %profile.id, learner_id = %learner_id, "created learner profile");
        Ok(profile)
    }

    pub fn get_profile(&self, profile_id: &str) -> Result<LearnerProfile> {
        self.db
            .get_profile(profile_id)?
            .ok_or_else(|| MasteryError::ProfileNotFound(profile_id.to_string()))
    }

    pub fn find_profile(&self, profile_id: &str) -> Result<Option<LearnerProfile>> {
        Ok(self.db.get_profile(profile_id)?)
    }

    pub fn get_profile_by_learner(&self, learner_id: &str) -> Result<LearnerProfile> {
        self.db
            .get_profile_by_learner(learner_id.trim())?
            .ok_or_else(|| MasteryError::ProfileNotFound(learner_id.to_string()))
    }

    pub fn update_profile(
        &self,
        profile_id: &str,
        learning_velocity: Option<f64>,
        retention_rate: Option<f64>,
    ) -> Result<LearnerProfile> {
        let mut profile = self.get_profile(profile_id)?;

        if let Some(velocity) = learning_velocity.filter(|v| !v.is_nan()) {
            profile.learning_velocity = velocity.max(0.0);
        }
        if let Some(retention) = retention_rate.filter(|v| !v.is_nan()) {
            profile.retention_rate = retention.clamp(0.0, 1.0);
        }
        profile.updated_at = Utc::now();

        self.db.update_profile(&profile)?;
        Ok(profile)
    }

    // Concept operations

    pub fn create_concept(&self, new: NewConcept) -> Result<Concept> {
        let name = new.name.trim();
        if name.is_empty() {
            return Err(MasteryError::Validation("concept name must not be empty".into()));
        }
        if !(1..=10).contains(&new.difficulty) {
            return Err(MasteryError::Validation(format!(
                "difficulty must be between 1 and 10, got {}",
                new.difficulty
            )));
        }
        for prereq in &new.prerequisite_ids {
            if self.db.get_concept(prereq)?.is_none() {
                return Err(MasteryError::UnknownPrerequisite(prereq.clone()));
            }
        }

        let mut prerequisite_ids: Vec<String> = Vec::new();
        for id in new.prerequisite_ids {
            if !prerequisite_ids.contains(&id) {
                prerequisite_ids.push(id);
            }
        }

        let concept = Concept {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: new.description.filter(|d| !d.trim().is_empty()),
            subject: new.subject.trim().to_string(),
            topic: new.topic.trim().to_string(),
            subtopic: new.subtopic.filter(|s| !s.trim().is_empty()),
            difficulty: new.difficulty,
            prerequisite_ids,
            tags: normalize_tags(&new.tags),
            estimated_time_minutes: if new.estimated_time_minutes > 0 {
                new.estimated_time_minutes
            } else {
                DEFAULT_ESTIMATED_MINUTES
            },
            created_at: Utc::now(),
        };
        self.db.insert_concept(&concept)?;

        debug!(concept_id = %concept.id, name = %concept.name, "created concept");
        Ok(concept)
    }

    pub fn get_concept(&self, concept_id: &str) -> Result<Concept> {
        self.db
            .get_concept(concept_id)?
            .ok_or_else(|| MasteryError::ConceptNotFound(concept_id.to_string()))
    }

    pub fn find_concept_by_name(&self, name: &str) -> Result<Option<Concept>> {
        Ok(self.db.find_concept_by_name(name)?)
    }

    pub fn list_concepts(&self, subject: Option<&str>) -> Result<Vec<Concept>> {
        Ok(self.db.list_concepts(subject)?)
    }

    /// Replaces a concept's prerequisites, refusing edits that would close a cycle.
    pub fn update_prerequisites(&self, concept_id: &str, prerequisite_ids: &[String]) -> Result<Concept> {
        self.get_concept(concept_id)?;

        let concepts = self.db.list_concepts(None)?;
        let mut graph: HashMap<String, Vec<String>> = concepts
            .into_iter()
            .map(|c| (c.id, c.prerequisite_ids))
            .collect();

        let mut unique: Vec<String> = Vec::new();
        for prereq in prerequisite_ids {
            if !graph.contains_key(prereq) {
                return Err(MasteryError::UnknownPrerequisite(prereq.clone()));
            }
            if !unique.contains(prereq) {
                unique.push(prereq.clone());
            }
        }

        graph.insert(concept_id.to_string(), unique.clone());
        for prereq in &unique {
            if reaches(&graph, prereq, concept_id) {
                return Err(MasteryError::PrerequisiteCycle {
                    concept: concept_id.to_string(),
                    prerequisite: prereq.clone(),
                });
            }
        }

        self.db.set_concept_prerequisites(concept_id, &unique)?;
        self.get_concept(concept_id)
    }

    // Mastery operations

    pub fn record_practice(&self, profile_id: &str, concept_id: &str, update: PracticeUpdate) -> Result<MasteryRecord> {
        self.record_practice_at(profile_id, concept_id, update, Utc::now())
    }

    pub fn record_practice_at(
        &self,
        profile_id: &str,
        concept_id: &str,
        update: PracticeUpdate,
        now: DateTime<Utc>,
    ) -> Result<MasteryRecord> {
        validate_unit("direct score", update.direct_score)?;
        validate_unit("direct confidence", update.direct_confidence)?;

        let mut profile = self.get_profile(profile_id)?;
        self.get_concept(concept_id)?;

        let (mut record, is_new) = match self.db.get_mastery(profile_id, concept_id)? {
            Some(record) => (record, false),
            None => {
                profile.total_concepts_attempted += 1;
                (
                    MasteryRecord {
                        id: Uuid::new_v4().to_string(),
                        profile_id: profile_id.to_string(),
                        concept_id: concept_id.to_string(),
                        mastery_level: MasteryLevel::NotStarted,
                        mastery_score: 0.0,
                        confidence_score: 0.0,
                        attempts_count: 0,
                        correct_count: 0,
                        next_review_at: now + Duration::days(1),
                        review_interval_days: 1,
                        ease_factor: EASE_MAX,
                        first_seen_at: now,
                        last_practiced_at: None,
                        mastered_at: None,
                    },
                    true,
                )
            }
        };

        let newly_mastered = apply_practice(&mut record, &update, now);

        if is_new {
            self.db.insert_mastery(&record)?;
        } else {
            self.db.update_mastery(&record)?;
        }

        if newly_mastered {
            profile.total_concepts_mastered += 1;
            info!(profile_id = %profile_id, concept_id = %concept_id, "concept mastered");
        }

        let records = self.db.list_masteries(profile_id)?;
        profile.overall_mastery_score = if records.is_empty() {
            0.0
        } else {
            records.iter().map(|r| r.mastery_score).sum::<f64>() / records.len() as f64
        };
        profile.updated_at = now;
        self.db.update_profile(&profile)?;

        debug!(
            profile_id = %profile_id,
            concept_id = %concept_id,
            score = record.mastery_score,
            level = record.mastery_level.as_str(),
            interval_days = record.review_interval_days,
            "recorded practice"
        );
        Ok(record)
    }

    pub fn get_mastery(&self, profile_id: &str, concept_id: &str) -> Result<Option<MasteryRecord>> {
        Ok(self.db.get_mastery(profile_id, concept_id)?)
    }

    pub fn profile_masteries(&self, profile_id: &str) -> Result<Vec<MasteryRecord>> {
        self.get_profile(profile_id)?;
        Ok(self.db.list_masteries(profile_id)?)
    }

    pub fn due_for_review(&self, profile_id: &str, limit: usize) -> Result<Vec<MasteryRecord>> {
        self.due_for_review_at(profile_id, Utc::now(), limit)
    }

    pub fn due_for_review_at(&self, profile_id: &str, now: DateTime<Utc>, limit: usize) -> Result<Vec<MasteryRecord>> {
        self.get_profile(profile_id)?;
        Ok(self.db.due_masteries(profile_id, now, limit)?)
    }

    /// Stochastic pick among due records: longer overdue and lower score
    /// weigh more.
    pub fn next_concept_to_review(&self, profile_id: &str) -> Result<Option<ReviewCandidate>> {
        let now = Utc::now();
        let due = self.due_for_review_at(profile_id, now, REVIEW_POOL)?;
        let mut rng = rand::thread_rng();
        self.pick_review(due, now, &mut rng)
    }

    fn pick_review<R: Rng>(&self, due: Vec<MasteryRecord>, now: DateTime<Utc>, rng: &mut R) -> Result<Option<ReviewCandidate>> {
        let weights: Vec<f64> = due
            .iter()
            .map(|r| {
                let overdue_days = now.signed_duration_since(r.next_review_at).num_days().max(0) as f64 + 1.0;
                overdue_days * (1.0 - r.mastery_score + 0.1)
            })
            .collect();

        let Some(index) = pick_weighted(&weights, rng) else {
            return Ok(None);
        };
        let record = due[index].clone();
        let concept = self.get_concept(&record.concept_id)?;
        Ok(Some(ReviewCandidate { record, concept }))
    }

    // Activity and modality

    pub fn record_activity(&self, profile_id: &str) -> Result<LearnerProfile> {
        self.record_activity_at(profile_id, Utc::now())
    }

    pub fn record_activity_at(&self, profile_id: &str, now: DateTime<Utc>) -> Result<LearnerProfile> {
        let mut profile = self.get_profile(profile_id)?;
        advance_streak(&mut profile, now);
        self.db.update_profile(&profile)?;
        Ok(profile)
    }

    /// Unknown modality names leave the vector untouched.
    pub fn adjust_modality_preference(
        &self,
        profile_id: &str,
        modality: &str,
        success: bool,
        learning_rate: f64,
    ) -> Result<ModalityPreferences> {
        if learning_rate.is_nan() || !(0.0..=1.0).contains(&learning_rate) {
            return Err(MasteryError::Validation(format!(
                "learning rate must be within [0, 1], got {}",
                learning_rate
            )));
        }

        let mut profile = self.get_profile(profile_id)?;
        let Some(modality) = Modality::from_str(modality) else {
            debug!(profile_id = %profile_id, modality = %modality, "ignoring unknown modality");
            return Ok(profile.modality_preferences);
        };

        let current = profile.modality_preferences.get(modality);
        profile
            .modality_preferences
            .set(modality, adjust_weight(current, success, learning_rate));
        profile.updated_at = Utc::now();
        self.db.update_profile(&profile)?;

        Ok(profile.modality_preferences)
    }

    /// Falls back to the default modality when the profile is missing.
    pub fn preferred_modality(&self, profile_id: &str) -> Result<Modality> {
        Ok(self
            .db
            .get_profile(profile_id)?
            .map(|p| p.modality_preferences.preferred())
            .unwrap_or_default())
    }

    // Misconception operations

    pub fn raise_misconception(&self, profile_id: &str, new: NewMisconception) -> Result<Misconception> {
        self.get_profile(profile_id)?;
        if let Some(concept_id) = &new.concept_id {
            self.get_concept(concept_id)?;
        }

        let misconception = Misconception {
            id: Uuid::new_v4().to_string(),
            profile_id: profile_id.to_string(),
            concept_id: new.concept_id,
            misconception_type: if new.misconception_type.trim().is_empty() {
                "conceptual".to_string()
            } else {
                new.misconception_type
            },
            description: new.description,
            learner_belief: new.learner_belief,
            correct_understanding: new.correct_understanding,
            severity: new.severity,
            detection_source: if new.detection_source.trim().is_empty() {
                "assessment".to_string()
            } else {
                new.detection_source
            },
            learner_evidence_ids: new.learner_evidence_ids,
            academic_evidence_ids: new.academic_evidence_ids,
            is_resolved: false,
            resolution_notes: None,
            detected_at: Utc::now(),
            resolved_at: None,
        };
        self.db.insert_misconception(&misconception)?;

        info!(
            profile_id = %profile_id,
            misconception_id = %misconception.id,
            severity = misconception.severity.as_str(),
            source = %misconception.detection_source,
            "raised misconception"
        );
        Ok(misconception)
    }

    /// Idempotent; a second call keeps the first resolution time.
    pub fn resolve_misconception(&self, misconception_id: &str, notes: Option<&str>) -> Result<Misconception> {
        if !self.db.resolve_misconception(misconception_id, notes, Utc::now())? {
            return Err(MasteryError::MisconceptionNotFound(misconception_id.to_string()));
        }
        self.db
            .get_misconception(misconception_id)?
            .ok_or_else(|| MasteryError::MisconceptionNotFound(misconception_id.to_string()))
    }

    pub fn active_misconceptions(&self, profile_id: &str) -> Result<Vec<Misconception>> {
        self.get_profile(profile_id)?;
        Ok(self.db.active_misconceptions(profile_id)?)
    }

    // Session operations

    pub fn start_session(&self, profile_id: &str, session_type: SessionType, concepts_covered: Vec<String>) -> Result<LearningSession> {
        self.record_activity(profile_id)?;

        let session = LearningSession {
            id: Uuid::new_v4().to_string(),
            profile_id: profile_id.to_string(),
            session_type,
            concepts_covered,
            duration_minutes: 0,
            questions_attempted: 0,
            questions_correct: 0,
            focus_score: None,
            started_at: Utc::now(),
            ended_at: None,
        };
        self.db.insert_session(&session)?;

        debug!(profile_id = %profile_id, session_id = %session.id, kind = session_type.as_str(), "started session");
        Ok(session)
    }

    /// Ends a session once; ending an already-ended session returns it unchanged.
    pub fn end_session(&self, session_id: &str, stats: SessionStats) -> Result<LearningSession> {
        let mut session = self
            .db
            .get_session(session_id)?
            .ok_or_else(|| MasteryError::SessionNotFound(session_id.to_string()))?;

        if session.ended_at.is_some() {
            return Ok(session);
        }

        validate_unit("focus score", stats.focus_score)?;

        let now = Utc::now();
        session.ended_at = Some(now);
        session.duration_minutes = stats
            .duration_minutes
            .filter(|d| *d > 0)
            .unwrap_or_else(|| now.signed_duration_since(session.started_at).num_minutes())
            .max(0);
        if let Some(attempted) = stats.questions_attempted {
            session.questions_attempted = attempted.max(0);
        }
        if let Some(correct) = stats.questions_correct {
            session.questions_correct = correct.max(0);
        }
        session.focus_score = stats.focus_score.or(session.focus_score);
        self.db.update_session(&session)?;

        let mut profile = self.get_profile(&session.profile_id)?;
        profile.total_study_time_minutes += session.duration_minutes;
        profile.updated_at = now;
        self.db.update_profile(&profile)?;

        Ok(session)
    }

    pub fn list_sessions(&self, profile_id: &str) -> Result<Vec<LearningSession>> {
        self.get_profile(profile_id)?;
        Ok(self.db.list_sessions(profile_id)?)
    }

    // Reporting

    pub fn analytics(&self, profile_id: &str) -> Result<Analytics> {
        let profile = self.get_profile(profile_id)?;
        let masteries = self.db.list_masteries(profile_id)?;
        let concepts: HashMap<String, Concept> = self
            .db
            .list_concepts(None)?
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();
        let active = self.db.active_misconceptions(profile_id)?;

        let mut concepts_by_mastery: BTreeMap<String, i64> = BTreeMap::new();
        let mut subject_sums: BTreeMap<String, (f64, i64)> = BTreeMap::new();
        let mut top_strengths = Vec::new();
        let mut areas_for_improvement = Vec::new();

        for m in &masteries {
            *concepts_by_mastery
                .entry(m.mastery_level.as_str().to_string())
                .or_insert(0) += 1;

            let Some(concept) = concepts.get(&m.concept_id) else {
                continue;
            };
            let entry = subject_sums.entry(concept.subject.clone()).or_insert((0.0, 0));
            entry.0 += m.mastery_score;
            entry.1 += 1;

            match m.mastery_level {
                MasteryLevel::Mastered | MasteryLevel::Expert => {
                    if top_strengths.len() < LIST_CAP {
                        top_strengths.push(concept.name.clone());
                    }
                }
                MasteryLevel::Learning | MasteryLevel::Partial => {
                    if areas_for_improvement.len() < LIST_CAP {
                        areas_for_improvement.push(concept.name.clone());
                    }
                }
                MasteryLevel::NotStarted => {}
            }
        }

        let subjects_progress = subject_sums
            .into_iter()
            .map(|(subject, (sum, count))| (subject, sum / count as f64 * 100.0))
            .collect();

        let mastered_count = masteries.iter().filter(|m| m.mastery_level.is_mastered()).count();
        let overall_progress = if masteries.is_empty() {
            0.0
        } else {
            mastered_count as f64 / masteries.len() as f64 * 100.0
        };

        let levels: HashMap<&str, MasteryLevel> = masteries
            .iter()
            .map(|m| (m.concept_id.as_str(), m.mastery_level))
            .collect();
        let mut candidates: Vec<&Concept> = concepts
            .values()
            .filter(|c| {
                levels.get(c.id.as_str()).copied().unwrap_or(MasteryLevel::NotStarted) == MasteryLevel::NotStarted
                    && c.prerequisite_ids.iter().all(|p| {
                        levels.get(p.as_str()).is_some_and(|l| l.is_mastered())
                    })
            })
            .collect();
        candidates.sort_by(|a, b| a.difficulty.cmp(&b.difficulty).then_with(|| a.name.cmp(&b.name)));
        let recommended_next_concepts = candidates
            .into_iter()
            .take(LIST_CAP)
            .map(|c| c.name.clone())
            .collect();

        let now = Utc::now();
        let mut study_time_weekly = [0i64; 7];
        for session in self.db.list_sessions(profile_id)? {
            let days_ago = (now.date_naive() - session.started_at.date_naive()).num_days();
            if (0..7).contains(&days_ago) {
                study_time_weekly[6 - days_ago as usize] += session.duration_minutes;
            }
        }

        Ok(Analytics {
            profile_id: profile.id,
            overall_progress,
            overall_mastery_score: profile.overall_mastery_score,
            concepts_by_mastery,
            subjects_progress,
            top_strengths,
            areas_for_improvement,
            recommended_next_concepts,
            study_time_weekly,
            streak_info: StreakInfo {
                current: profile.current_streak_days,
                longest: profile.longest_streak_days,
            },
            active_misconceptions: active.len(),
        })
    }

    pub fn knowledge_graph(&self, profile_id: &str) -> Result<KnowledgeGraph> {
        self.get_profile(profile_id)?;
        let masteries: HashMap<String, MasteryRecord> = self
            .db
            .list_masteries(profile_id)?
            .into_iter()
            .map(|m| (m.concept_id.clone(), m))
            .collect();

        let mut nodes = Vec::new();
        let mut edges = Vec::new();
        for concept in self.db.list_concepts(None)? {
            let (level, score) = masteries
                .get(&concept.id)
                .map(|m| (m.mastery_level, m.mastery_score))
                .unwrap_or((MasteryLevel::NotStarted, 0.0));

            for prereq in &concept.prerequisite_ids {
                edges.push(GraphEdge {
                    source: prereq.clone(),
                    target: concept.id.clone(),
                    relationship: "prerequisite".to_string(),
                });
            }

            nodes.push(GraphNode {
                id: concept.id,
                name: concept.name,
                subject: concept.subject,
                topic: concept.topic,
                mastery_level: level,
                mastery_score: score,
            });
        }

        Ok(KnowledgeGraph { nodes, edges })
    }
}

// Depth-first search along prerequisite edges
fn reaches(graph: &HashMap<String, Vec<String>>, from: &str, target: &str) -> bool {
    let mut stack = vec![from.to_string()];
    let mut seen: HashSet<String> = HashSet::new();

    while let Some(node) = stack.pop() {
        if node == target {
            return true;
        }
        if !seen.insert(node.clone()) {
            continue;
        }
        if let Some(next) = graph.get(&node) {
            stack.extend(next.iter().cloned());
        }
    }
    false
}

fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for tag in tags {
        let tag = tag.trim().to_lowercase();
        if !tag.is_empty() && !out.contains(&tag) {
            out.push(tag);
        }
    }
    out
}
