use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Discrete mastery ladder derived from the continuous mastery score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MasteryLevel {
    NotStarted,
    Learning,
    Partial,
    Mastered,
    Expert,
}

impl MasteryLevel {
    pub const ALL: [MasteryLevel; 5] = [
        MasteryLevel::NotStarted,
        MasteryLevel::Learning,
        MasteryLevel::Partial,
        MasteryLevel::Mastered,
        MasteryLevel::Expert,
    ];

    /// Fixed breakpoints: 0.95 expert, 0.80 mastered, 0.50 partial, anything
    /// above zero is learning.
    pub fn from_score(score: f64) -> Self {
        if score >= 0.95 {
            MasteryLevel::Expert
        } else if score >= 0.8 {
            MasteryLevel::Mastered
        } else if score >= 0.5 {
            MasteryLevel::Partial
        } else if score > 0.0 {
            MasteryLevel::Learning
        } else {
            MasteryLevel::NotStarted
        }
    }

    pub fn is_mastered(&self) -> bool {
        matches!(self, MasteryLevel::Mastered | MasteryLevel::Expert)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MasteryLevel::NotStarted => "not_started",
            MasteryLevel::Learning => "learning",
            MasteryLevel::Partial => "partial",
            MasteryLevel::Mastered => "mastered",
            MasteryLevel::Expert => "expert",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            MasteryLevel::NotStarted => "Not started",
            MasteryLevel::Learning => "Learning",
            MasteryLevel::Partial => "Partial",
            MasteryLevel::Mastered => "Mastered",
            MasteryLevel::Expert => "Expert",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "not_started" | "new" => Some(MasteryLevel::NotStarted),
            "learning" => Some(MasteryLevel::Learning),
            "partial" => Some(MasteryLevel::Partial),
            "mastered" => Some(MasteryLevel::Mastered),
            "expert" => Some(MasteryLevel::Expert),
            _ => None,
        }
    }
}

// Explanation styles. The enumeration order is the tie-break order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Visual,
    Verbal,
    Abstract,
    Analogy,
    Interactive,
}

impl Modality {
    pub const ALL: [Modality; 5] = [
        Modality::Visual,
        Modality::Verbal,
        Modality::Abstract,
        Modality::Analogy,
        Modality::Interactive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Visual => "visual",
            Modality::Verbal => "verbal",
            Modality::Abstract => "abstract",
            Modality::Analogy => "analogy",
            Modality::Interactive => "interactive",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "visual" => Some(Modality::Visual),
            "verbal" => Some(Modality::Verbal),
            "abstract" => Some(Modality::Abstract),
            "analogy" => Some(Modality::Analogy),
            "interactive" => Some(Modality::Interactive),
            _ => None,
        }
    }
}

impl Default for Modality {
    fn default() -> Self {
        Modality::Visual
    }
}

/// Per-style preference weights, each kept in [0, 1]. The weights are
/// independent and do not sum to a fixed total.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModalityPreferences {
    pub visual: f64,
    pub verbal: f64,
    pub r#abstract: f64,
    pub analogy: f64,
    pub interactive: f64,
}

impl ModalityPreferences {
    pub const NEUTRAL: f64 = 0.5;

    pub fn neutral() -> Self {
        Self {
            visual: Self::NEUTRAL,
            verbal: Self::NEUTRAL,
            r#abstract: Self::NEUTRAL,
            analogy: Self::NEUTRAL,
            interactive: Self::NEUTRAL,
        }
    }

    pub fn get(&self, modality: Modality) -> f64 {
        match modality {
            Modality::Visual => self.visual,
            Modality::Verbal => self.verbal,
            Modality::Abstract => self.r#abstract,
            Modality::Analogy => self.analogy,
            Modality::Interactive => self.interactive,
        }
    }

    pub fn set(&mut self, modality: Modality, weight: f64) {
        let weight = if weight.is_nan() { Self::NEUTRAL } else { weight.clamp(0.0, 1.0) };
        match modality {
            Modality::Visual => self.visual = weight,
            Modality::Verbal => self.verbal = weight,
            Modality::Abstract => self.r#abstract = weight,
            Modality::Analogy => self.analogy = weight,
            Modality::Interactive => self.interactive = weight,
        }
    }

    // Argmax; strict comparison keeps the earliest modality on ties
    pub fn preferred(&self) -> Modality {
        let mut best = Modality::Visual;
        let mut best_weight = self.get(best);
        for modality in Modality::ALL.iter().skip(1) {
            let weight = self.get(*modality);
            if weight > best_weight {
                best = *modality;
                best_weight = weight;
            }
        }
        best
    }
}

impl Default for ModalityPreferences {
    fn default() -> Self {
        Self::neutral()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnerProfile {
    pub id: String,
    pub learner_id: String,
    pub overall_mastery_score: f64,
    pub learning_velocity: f64,
    pub retention_rate: f64,
    pub modality_preferences: ModalityPreferences,
    pub total_study_time_minutes: i64,
    pub total_concepts_attempted: i64,
    pub total_concepts_mastered: i64,
    pub current_streak_days: i64,
    pub longest_streak_days: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_activity_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Concept {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub subject: String,
    pub topic: String,
    pub subtopic: Option<String>,
    pub difficulty: i32,
    pub prerequisite_ids: Vec<String>,
    pub tags: Vec<String>,
    pub estimated_time_minutes: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewConcept {
    pub name: String,
    pub description: Option<String>,
    pub subject: String,
    pub topic: String,
    pub subtopic: Option<String>,
    pub difficulty: i32,
    pub prerequisite_ids: Vec<String>,
    pub tags: Vec<String>,
    pub estimated_time_minutes: i32,
}

// One per (profile, concept), created on first practice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasteryRecord {
    pub id: String,
    pub profile_id: String,
    pub concept_id: String,
    pub mastery_level: MasteryLevel,
    pub mastery_score: f64,
    pub confidence_score: f64,
    pub attempts_count: i64,
    pub correct_count: i64,
    pub next_review_at: DateTime<Utc>,
    pub review_interval_days: i64,
    pub ease_factor: f64,
    pub first_seen_at: DateTime<Utc>,
    pub last_practiced_at: Option<DateTime<Utc>>,
    pub mastered_at: Option<DateTime<Utc>>,
}

impl MasteryRecord {
    pub fn accuracy(&self) -> f64 {
        if self.attempts_count == 0 {
            0.0
        } else {
            self.correct_count as f64 / self.attempts_count as f64
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_review_at <= now
    }
}

/// A single practice event. `direct_score` and `direct_confidence` override
/// the accuracy-derived values when present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PracticeUpdate {
    pub correct: Option<bool>,
    pub direct_score: Option<f64>,
    pub direct_confidence: Option<f64>,
}

impl PracticeUpdate {
    pub fn answered(correct: bool) -> Self {
        Self {
            correct: Some(correct),
            ..Default::default()
        }
    }

    pub fn scored(score: f64) -> Self {
        Self {
            direct_score: Some(score),
            ..Default::default()
        }
    }
}

// Profile-level misconception severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MisconceptionSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl MisconceptionSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            MisconceptionSeverity::Low => "low",
            MisconceptionSeverity::Medium => "medium",
            MisconceptionSeverity::High => "high",
            MisconceptionSeverity::Critical => "critical",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(MisconceptionSeverity::Low),
            "medium" => Some(MisconceptionSeverity::Medium),
            "high" => Some(MisconceptionSeverity::High),
            "critical" => Some(MisconceptionSeverity::Critical),
            _ => None,
        }
    }
}

impl Default for MisconceptionSeverity {
    fn default() -> Self {
        MisconceptionSeverity::Medium
    }
}

// Severity scale used by gap detection, kept separate from MisconceptionSeverity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapSeverity {
    Minor,
    Moderate,
    Significant,
    Critical,
}

impl GapSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            GapSeverity::Minor => "minor",
            GapSeverity::Moderate => "moderate",
            GapSeverity::Significant => "significant",
            GapSeverity::Critical => "critical",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "minor" => Some(GapSeverity::Minor),
            "moderate" => Some(GapSeverity::Moderate),
            "significant" => Some(GapSeverity::Significant),
            "critical" => Some(GapSeverity::Critical),
            _ => None,
        }
    }

    /// Gaps at or above `Significant` become tracked misconceptions.
    pub fn escalates(&self) -> bool {
        *self >= GapSeverity::Significant
    }

    pub fn to_misconception_severity(self) -> MisconceptionSeverity {
        match self {
            GapSeverity::Minor => MisconceptionSeverity::Low,
            GapSeverity::Moderate => MisconceptionSeverity::Medium,
            GapSeverity::Significant => MisconceptionSeverity::High,
            GapSeverity::Critical => MisconceptionSeverity::Critical,
        }
    }

    pub fn priority(&self) -> f64 {
        match self {
            GapSeverity::Minor => 0.25,
            GapSeverity::Moderate => 0.5,
            GapSeverity::Significant => 0.75,
            GapSeverity::Critical => 1.0,
        }
    }
}

impl Default for GapSeverity {
    fn default() -> Self {
        GapSeverity::Moderate
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Misconception {
    pub id: String,
    pub profile_id: String,
    pub concept_id: Option<String>,
    pub misconception_type: String,
    pub description: String,
    pub learner_belief: String,
    pub correct_understanding: String,
    pub severity: MisconceptionSeverity,
    pub detection_source: String,
    pub learner_evidence_ids: Vec<String>,
    pub academic_evidence_ids: Vec<String>,
    pub is_resolved: bool,
    pub resolution_notes: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewMisconception {
    pub concept_id: Option<String>,
    pub misconception_type: String,
    pub description: String,
    pub learner_belief: String,
    pub correct_understanding: String,
    pub severity: MisconceptionSeverity,
    pub detection_source: String,
    pub learner_evidence_ids: Vec<String>,
    pub academic_evidence_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Lesson,
    Practice,
    Assessment,
    Chat,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::Lesson => "lesson",
            SessionType::Practice => "practice",
            SessionType::Assessment => "assessment",
            SessionType::Chat => "chat",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "lesson" | "l" => Some(SessionType::Lesson),
            "practice" | "p" => Some(SessionType::Practice),
            "assessment" | "a" => Some(SessionType::Assessment),
            "chat" | "c" => Some(SessionType::Chat),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningSession {
    pub id: String,
    pub profile_id: String,
    pub session_type: SessionType,
    pub concepts_covered: Vec<String>,
    pub duration_minutes: i64,
    pub questions_attempted: i64,
    pub questions_correct: i64,
    pub focus_score: Option<f64>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub duration_minutes: Option<i64>,
    pub questions_attempted: Option<i64>,
    pub questions_correct: Option<i64>,
    pub focus_score: Option<f64>,
}

// What kind of interaction produced a piece of learner-history evidence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextType {
    Question,
    Explanation,
    Chat,
    Assessment,
}

impl ContextType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextType::Question => "question",
            ContextType::Explanation => "explanation",
            ContextType::Chat => "chat",
            ContextType::Assessment => "assessment",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "question" | "q" => Some(ContextType::Question),
            "explanation" | "e" => Some(ContextType::Explanation),
            "chat" | "c" => Some(ContextType::Chat),
            "assessment" | "a" => Some(ContextType::Assessment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Textbook,
    Lecture,
    Pdf,
    Curriculum,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Textbook => "textbook",
            SourceType::Lecture => "lecture",
            SourceType::Pdf => "pdf",
            SourceType::Curriculum => "curriculum",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "textbook" | "book" => Some(SourceType::Textbook),
            "lecture" => Some(SourceType::Lecture),
            "pdf" => Some(SourceType::Pdf),
            "curriculum" => Some(SourceType::Curriculum),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Learner,
    Academic,
}

impl EvidenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceKind::Learner => "learner",
            EvidenceKind::Academic => "academic",
        }
    }
}

// Learner-history evidence: what the learner asked, answered or was told
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnerEvidence {
    pub id: String,
    pub profile_id: String,
    pub context_type: ContextType,
    pub content: String,
    pub concept_id: Option<String>,
    pub concept_name: Option<String>,
    pub subject: Option<String>,
    pub topic: Option<String>,
    pub tags: Vec<String>,
    pub was_correct: Option<bool>,
    pub confidence_score: Option<f64>,
    pub index_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLearnerContext {
    pub context_type: ContextType,
    pub content: String,
    pub concept_id: Option<String>,
    pub concept_name: Option<String>,
    pub subject: Option<String>,
    pub topic: Option<String>,
    pub tags: Vec<String>,
    pub was_correct: Option<bool>,
    pub confidence_score: Option<f64>,
}

impl NewLearnerContext {
    pub fn new(context_type: ContextType, content: impl Into<String>) -> Self {
        Self {
            context_type,
            content: content.into(),
            concept_id: None,
            concept_name: None,
            subject: None,
            topic: None,
            tags: vec![],
            was_correct: None,
            confidence_score: None,
        }
    }
}

// One chunk of a verified academic document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcademicChunk {
    pub id: String,
    pub document_id: String,
    pub title: String,
    pub source_type: SourceType,
    pub source_name: String,
    pub content: String,
    pub chunk_index: i64,
    pub total_chunks: i64,
    pub subject: String,
    pub topic: String,
    pub subtopic: Option<String>,
    pub grade_level: Option<String>,
    pub tags: Vec<String>,
    pub difficulty: i32,
    pub is_verified: bool,
    pub quality_score: f64,
    pub index_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAcademicDocument {
    pub title: String,
    pub source_type: SourceType,
    pub source_name: String,
    pub content: String,
    pub subject: String,
    pub topic: String,
    pub subtopic: Option<String>,
    pub grade_level: Option<String>,
    pub tags: Vec<String>,
    pub difficulty: i32,
}

// A ranked hit as surfaced to callers; score is similarity, higher is better
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedEvidence {
    pub id: String,
    pub kind: EvidenceKind,
    pub content: String,
    pub relevance_score: f64,
    pub metadata: BTreeMap<String, String>,
}

impl RetrievedEvidence {
    pub fn source_name(&self) -> Option<&str> {
        self.metadata.get("source_name").map(|s| s.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapFinding {
    pub id: String,
    pub profile_id: String,
    pub concept_id: Option<String>,
    pub concept_name: String,
    pub learner_belief: String,
    pub correct_understanding: String,
    pub description: String,
    pub severity: GapSeverity,
    pub priority_score: f64,
    pub is_resolved: bool,
    pub resolution_strategy: Option<String>,
    pub learner_evidence_ids: Vec<String>,
    pub academic_evidence_ids: Vec<String>,
    pub misconception_id: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "user" => Some(ChatRole::User),
            "assistant" => Some(ChatRole::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub id: String,
    pub profile_id: String,
    pub session_id: String,
    pub role: ChatRole,
    pub content: String,
    pub concept_id: Option<String>,
    pub learner_evidence_ids: Vec<String>,
    pub academic_evidence_ids: Vec<String>,
    pub was_helpful: Option<bool>,
    pub created_at: DateTime<Utc>,
}

// JSON output wrapper for CLI
#[derive(Debug, Serialize)]
pub struct JsonOutput<T: Serialize> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> JsonOutput<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod mastery_level_tests {
        use super::*;

        #[test]
        fn from_score_breakpoints() {
            assert_eq!(MasteryLevel::from_score(1.0), MasteryLevel::Expert);
            assert_eq!(MasteryLevel::from_score(0.95), MasteryLevel::Expert);
            assert_eq!(MasteryLevel::from_score(0.94), MasteryLevel::Mastered);
            assert_eq!(MasteryLevel::from_score(0.8), MasteryLevel::Mastered);
            assert_eq!(MasteryLevel::from_score(0.79), MasteryLevel::Partial);
            assert_eq!(MasteryLevel::from_score(0.5), MasteryLevel::Partial);
            assert_eq!(MasteryLevel::from_score(0.49), MasteryLevel::Learning);
            assert_eq!(MasteryLevel::from_score(0.01), MasteryLevel::Learning);
            assert_eq!(MasteryLevel::from_score(0.0), MasteryLevel::NotStarted);
        }

        #[test]
        fn two_thirds_is_partial() {
            assert_eq!(MasteryLevel::from_score(2.0 / 3.0), MasteryLevel::Partial);
        }

        #[test]
        fn is_mastered_only_for_top_levels() {
            assert!(MasteryLevel::Mastered.is_mastered());
            assert!(MasteryLevel::Expert.is_mastered());
            assert!(!MasteryLevel::Partial.is_mastered());
            assert!(!MasteryLevel::NotStarted.is_mastered());
        }

        #[test]
        fn as_str_round_trips_through_from_str() {
            for level in MasteryLevel::ALL {
                assert_eq!(MasteryLevel::from_str(level.as_str()), Some(level));
            }
            assert_eq!(MasteryLevel::from_str("bogus"), None);
        }
    }

    mod modality_tests {
        use super::*;

        #[test]
        fn from_str_is_case_insensitive() {
            assert_eq!(Modality::from_str("Visual"), Some(Modality::Visual));
            assert_eq!(Modality::from_str(" ANALOGY "), Some(Modality::Analogy));
            assert_eq!(Modality::from_str("kinesthetic"), None);
        }

        #[test]
        fn neutral_preferences_prefer_visual() {
            let prefs = ModalityPreferences::neutral();
            assert_eq!(prefs.preferred(), Modality::Visual);
            for m in Modality::ALL {
                assert_eq!(prefs.get(m), 0.5);
            }
        }

        #[test]
        fn preferred_is_argmax() {
            let mut prefs = ModalityPreferences::neutral();
            prefs.set(Modality::Analogy, 0.9);
            assert_eq!(prefs.preferred(), Modality::Analogy);
        }

        #[test]
        fn ties_break_by_enumeration_order() {
            let mut prefs = ModalityPreferences::neutral();
            prefs.set(Modality::Interactive, 0.8);
            prefs.set(Modality::Verbal, 0.8);
            assert_eq!(prefs.preferred(), Modality::Verbal);
        }

        #[test]
        fn set_clamps_to_unit_interval() {
            let mut prefs = ModalityPreferences::neutral();
            prefs.set(Modality::Verbal, 1.7);
            prefs.set(Modality::Abstract, -0.3);
            assert_eq!(prefs.verbal, 1.0);
            assert_eq!(prefs.r#abstract, 0.0);
        }

        #[test]
        fn abstract_serializes_without_raw_prefix() {
            let json = serde_json::to_string(&ModalityPreferences::neutral()).unwrap();
            assert!(json.contains("\"abstract\":0.5"));
        }
    }

    mod severity_tests {
        use super::*;

        #[test]
        fn gap_severity_maps_onto_misconception_scale() {
            assert_eq!(GapSeverity::Minor.to_misconception_severity(), MisconceptionSeverity::Low);
            assert_eq!(
                GapSeverity::Moderate.to_misconception_severity(),
                MisconceptionSeverity::Medium
            );
            assert_eq!(
                GapSeverity::Significant.to_misconception_severity(),
                MisconceptionSeverity::High
            );
            assert_eq!(
                GapSeverity::Critical.to_misconception_severity(),
                MisconceptionSeverity::Critical
            );
        }

        #[test]
        fn only_significant_and_critical_escalate() {
            assert!(!GapSeverity::Minor.escalates());
            assert!(!GapSeverity::Moderate.escalates());
            assert!(GapSeverity::Significant.escalates());
            assert!(GapSeverity::Critical.escalates());
        }

        #[test]
        fn priority_grows_with_severity() {
            assert!(GapSeverity::Minor.priority() < GapSeverity::Moderate.priority());
            assert!(GapSeverity::Significant.priority() < GapSeverity::Critical.priority());
        }

        #[test]
        fn gap_severity_from_str() {
            assert_eq!(GapSeverity::from_str("Significant"), Some(GapSeverity::Significant));
            assert_eq!(GapSeverity::from_str("high"), None);
            assert_eq!(MisconceptionSeverity::from_str("high"), Some(MisconceptionSeverity::High));
        }
    }

    mod record_tests {
        use super::*;

        fn make_record(attempts: i64, correct: i64) -> MasteryRecord {
            let now = Utc::now();
            MasteryRecord {
                id: "r".into(),
                profile_id: "p".into(),
                concept_id: "c".into(),
                mastery_level: MasteryLevel::NotStarted,
                mastery_score: 0.0,
                confidence_score: 0.0,
                attempts_count: attempts,
                correct_count: correct,
                next_review_at: now,
                review_interval_days: 1,
                ease_factor: 2.5,
                first_seen_at: now,
                last_practiced_at: None,
                mastered_at: None,
            }
        }

        #[test]
        fn accuracy_zero_attempts() {
            assert_eq!(make_record(0, 0).accuracy(), 0.0);
        }

        #[test]
        fn accuracy_ratio() {
            assert_eq!(make_record(4, 3).accuracy(), 0.75);
        }

        #[test]
        fn is_due_compares_against_now() {
            let record = make_record(1, 1);
            assert!(record.is_due(record.next_review_at));
            assert!(!record.is_due(record.next_review_at - chrono::Duration::seconds(1)));
        }
    }

    mod enum_conversion_tests {
        use super::*;

        #[test]
        fn session_type_from_str() {
            assert_eq!(SessionType::from_str("chat"), Some(SessionType::Chat));
            assert_eq!(SessionType::from_str("P"), Some(SessionType::Practice));
            assert_eq!(SessionType::from_str("nap"), None);
        }

        #[test]
        fn context_and_source_types() {
            assert_eq!(ContextType::from_str("question"), Some(ContextType::Question));
            assert_eq!(SourceType::from_str("book"), Some(SourceType::Textbook));
            assert_eq!(SourceType::Lecture.as_str(), "lecture");
        }

        #[test]
        fn chat_role_round_trip() {
            assert_eq!(ChatRole::from_str(ChatRole::User.as_str()), Some(ChatRole::User));
            assert_eq!(ChatRole::from_str("system"), None);
        }
    }

    mod json_output_tests {
        use super::*;

        #[test]
        fn serializes_ok_correctly() {
            let output = JsonOutput::ok("test");
            let json = serde_json::to_string(&output).unwrap();
            assert!(json.contains("\"success\":true"));
            assert!(json.contains("\"data\":\"test\""));
            assert!(json.contains("\"error\":null"));
        }

        #[test]
        fn serializes_err_correctly() {
            let output = JsonOutput::<()>::err("error");
            let json = serde_json::to_string(&output).unwrap();
            assert!(json.contains("\"success\":false"));
            assert!(json.contains("\"data\":null"));
            assert!(json.contains("\"error\":\"error\""));
        }
    }
}
