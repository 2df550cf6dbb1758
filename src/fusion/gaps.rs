use serde::Deserialize;

use crate::generator::GenerationError;
use crate::models::GapSeverity;

/// A discrepancy reported by the generator, before it is stored.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedGap {
    pub concept_name: String,
    pub learner_belief: String,
    pub correct_understanding: String,
    pub description: String,
    pub severity: GapSeverity,
}

#[derive(Debug, Deserialize)]
struct RawGap {
    #[serde(default)]
    concept_name: Option<String>,
    #[serde(default, alias = "learner_understanding", alias = "learner_belief")]
    student_understanding: Option<String>,
    #[serde(default)]
    correct_understanding: Option<String>,
    #[serde(default, alias = "description")]
    gap_description: Option<String>,
    #[serde(default)]
    severity: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GapPayload {
    Wrapped { gaps: Vec<RawGap> },
    Bare(Vec<RawGap>),
}

impl From<RawGap> for DetectedGap {
    fn from(raw: RawGap) -> Self {
        let text = |v: Option<String>| v.map(|s| s.trim().to_string()).unwrap_or_default();
        let concept_name = text(raw.concept_name);
        Self {
            concept_name: if concept_name.is_empty() {
                "Unknown".to_string()
            } else {
                concept_name
            },
            learner_belief: text(raw.student_understanding),
            correct_understanding: text(raw.correct_understanding),
            description: text(raw.gap_description),
            severity: raw
                .severity
                .as_deref()
                .and_then(GapSeverity::from_str)
                .unwrap_or_default(),
        }
    }
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Parses `{"gaps": [...]}` or a bare array. Anything else is malformed.
pub fn parse_gaps(text: &str) -> Result<Vec<DetectedGap>, GenerationError> {
    let payload: GapPayload = serde_json::from_str(strip_code_fence(text))
        .map_err(|e| GenerationError::Malformed(e.to_string()))?;

    let raw = match payload {
        GapPayload::Wrapped { gaps } => gaps,
        GapPayload::Bare(gaps) => gaps,
    };
    Ok(raw.into_iter().map(DetectedGap::from).collect())
}
