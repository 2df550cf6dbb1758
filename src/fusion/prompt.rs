use crate::generator::{GenerationRequest, OutputMode};
use crate::models::{GapFinding, Modality, RetrievedEvidence};

pub const GAP_TEMPERATURE: f64 = 0.3;
pub const SYNTHESIS_TEMPERATURE: f64 = 0.7;
pub const SYNTHESIS_CONFIDENCE: f64 = 0.85;
pub const FALLBACK_CONFIDENCE: f64 = 0.5;

/// Items per source shown to gap detection.
pub const GAP_EVIDENCE_ITEMS: usize = 3;
const FALLBACK_ACADEMIC_CHARS: usize = 500;
const FALLBACK_LEARNER_CHARS: usize = 300;

const NO_LEARNER_CONTEXT: &str = "No previous context available.";
const NO_ACADEMIC_SOURCES: &str = "No academic sources found.";

pub fn style_guide(modality: Modality) -> &'static str {
    match modality {
        Modality::Visual => {
            "Use diagrams descriptions, bullet points, and visual metaphors. Structure information visually."
        }
        Modality::Verbal => "Explain thoroughly with detailed verbal descriptions. Use conversational tone.",
        Modality::Abstract => {
            "Focus on underlying principles and theoretical frameworks. Use formal language."
        }
        Modality::Analogy => "Use many real-world analogies and comparisons to familiar concepts.",
        Modality::Interactive => {
            "Include questions, prompts for reflection, and step-by-step walkthroughs."
        }
    }
}

pub fn learner_text(evidence: &[RetrievedEvidence]) -> String {
    if evidence.is_empty() {
        return NO_LEARNER_CONTEXT.to_string();
    }
    evidence
        .iter()
        .map(|e| format!("- {}", e.content))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn academic_text(evidence: &[RetrievedEvidence]) -> String {
    if evidence.is_empty() {
        return NO_ACADEMIC_SOURCES.to_string();
    }
    evidence
        .iter()
        .map(|e| format!("- [{}]: {}", e.source_name().unwrap_or("Source"), e.content))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn gap_request(query: &str, learner: &[RetrievedEvidence], academic: &[RetrievedEvidence]) -> GenerationRequest {
    let join_top = |items: &[RetrievedEvidence]| {
        items
            .iter()
            .take(GAP_EVIDENCE_ITEMS)
            .map(|e| e.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    };

    let system = "You are an educational analyst. Compare the learner's understanding \
with the academic sources and identify any misconceptions or gaps.
Return a JSON object {\"gaps\": [...]} where each gap has:
- concept_name: the concept with the gap
- student_understanding: what the learner seems to believe
- correct_understanding: what the academic source states
- gap_description: brief description of the discrepancy
- severity: \"minor\", \"moderate\", \"significant\", or \"critical\"
If no gaps are found, return {\"gaps\": []}."
        .to_string();

    let user = format!(
        "Query: {}\n\nLearner's context/history:\n{}\n\nAcademic sources:\n{}\n\n\
Identify gaps between the learner's understanding and the academic sources.",
        query,
        join_top(learner),
        join_top(academic)
    );

    GenerationRequest {
        system,
        user,
        temperature: GAP_TEMPERATURE,
        mode: OutputMode::Json,
    }
}

fn describe_gaps(gaps: &[GapFinding]) -> String {
    if gaps.is_empty() {
        return "None detected".to_string();
    }
    gaps.iter()
        .map(|g| {
            format!(
                "- {} ({}): learner believes \"{}\"; correct: \"{}\". {}",
                g.concept_name,
                g.severity.as_str(),
                g.learner_belief,
                g.correct_understanding,
                g.description
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn synthesis_request(
    query: &str,
    learner: &[RetrievedEvidence],
    academic: &[RetrievedEvidence],
    modality: Modality,
    gaps: &[GapFinding],
) -> GenerationRequest {
    let system = format!(
        "You are an adaptive personal mentor.

Your task is to answer the learner's question using both their personal learning history \
and verified academic sources. Personalize your explanation based on their learning style.

Learning Style Preference: {}
Style Guide: {}

Guidelines:
1. Reference the learner's past interactions to build on their existing knowledge
2. Use academic sources for accuracy and cite them
3. Address any misconceptions gently
4. Keep explanations clear and at the appropriate level
5. End with a thought-provoking question or next step",
        modality.as_str(),
        style_guide(modality)
    );

    let user = format!(
        "Learner's Question: {}\n\nLearner's Learning History:\n{}\n\nAcademic Sources:\n{}\n\n\
Known Gaps/Misconceptions to Address:\n{}\n\nPlease provide a personalized explanation.",
        query,
        learner_text(learner),
        academic_text(academic),
        describe_gaps(gaps)
    );

    GenerationRequest {
        system,
        user,
        temperature: SYNTHESIS_TEMPERATURE,
        mode: OutputMode::Text,
    }
}

/// Deterministic answer used whenever synthesis is unavailable.
pub fn fallback_answer(query: &str, learner: &[RetrievedEvidence], academic: &[RetrievedEvidence]) -> String {
    let academic_part = if academic.is_empty() {
        "No sources available.".to_string()
    } else {
        truncate_chars(&academic_text(academic), FALLBACK_ACADEMIC_CHARS)
    };
    let learner_part = if learner.is_empty() {
        "This appears to be a new topic for you.".to_string()
    } else {
        truncate_chars(&learner_text(learner), FALLBACK_LEARNER_CHARS)
    };

    format!(
        "Based on your question about \"{}\", here's what I found:\n\n\
**From Academic Sources:**\n{}\n\n\
**Building on Your Previous Learning:**\n{}\n\n\
For a more detailed, personalized explanation, please ensure the text generation service is configured.",
        query, academic_part, learner_part
    )
}

pub fn follow_up_questions(concept_name: &str) -> Vec<String> {
    vec![
        format!("Can you explain how {} relates to real-world applications?", concept_name),
        format!("What are common mistakes when learning {}?", concept_name),
        format!("Can you give me a practice problem about {}?", concept_name),
    ]
}

/// Prefix of at most `max_chars` characters, never splitting a code point.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((byte_index, _)) => s[..byte_index].to_string(),
        None => s.to_string(),
    }
}
