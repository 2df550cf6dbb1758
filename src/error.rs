use thiserror::Error;

use crate::index::IndexError;

#[derive(Debug, Error)]
pub enum MasteryError {
    #[error("profile not found: {0}")]
    ProfileNotFound(String),
    #[error("concept not found: {0}")]
    ConceptNotFound(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("misconception not found: {0}")]
    MisconceptionNotFound(String),
    #[error("a profile already exists for learner {0}")]
    ProfileExists(String),
    #[error("prerequisite {prerequisite} would make {concept} depend on itself")]
    PrerequisiteCycle { concept: String, prerequisite: String },
    #[error("unknown prerequisite concept: {0}")]
    UnknownPrerequisite(String),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),
}

impl MasteryError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            MasteryError::ProfileNotFound(_)
                | MasteryError::ConceptNotFound(_)
                | MasteryError::SessionNotFound(_)
                | MasteryError::MisconceptionNotFound(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum FusionError {
    #[error(transparent)]
    Mastery(#[from] MasteryError),
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("evidence index error: {0}")]
    Index(#[from] IndexError),
    #[error("gap not found: {0}")]
    GapNotFound(String),
    #[error("chat message not found: {0}")]
    MessageNotFound(String),
    #[error("concept not found: {0}")]
    ConceptNotFound(String),
    #[error("academic document not found: {0}")]
    DocumentNotFound(String),
    #[error("invalid input: {0}")]
    Validation(String),
}
