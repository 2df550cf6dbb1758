//! Dual-source retrieval and answer fusion.
//!
//! A query reads the learner's profile for personalization, searches the
//! learner-history and academic collections in parallel, asks the text
//! generator for gaps between the two, synthesizes an answer (or falls back
//! to a template) and writes the interaction back as new learner history.

pub mod chunk;
pub mod gaps;
pub mod prompt;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::FusionSettings;
use crate::db::Database;
use crate::error::FusionError;
use crate::generator::{GenerationError, GenerationRequest, TextGenerator};
use crate::index::{Collection, EvidenceIndex, IndexError, IndexStats, Metadata};
use crate::mastery::MasteryEngine;
use crate::models::{
    AcademicChunk, ChatRole, ChatTurn, ContextType, EvidenceKind, GapFinding, LearnerEvidence, Modality,
    NewAcademicDocument, NewLearnerContext, NewMisconception, RetrievedEvidence,
};

use self::chunk::chunk_text;
use self::gaps::{parse_gaps, DetectedGap};
use self::prompt::{
    fallback_answer, follow_up_questions, gap_request, synthesis_request, truncate_chars, FALLBACK_CONFIDENCE,
    SYNTHESIS_CONFIDENCE,
};

pub type Result<T> = std::result::Result<T, FusionError>;

const WRITE_BACK_QUERY_CHARS: usize = 500;
const WRITE_BACK_ANSWER_CHARS: usize = 500;
const CITED_SOURCES: usize = 3;
const ESCALATED_MISCONCEPTION_TYPE: &str = "knowledge_gap";
const DETECTION_SOURCE: &str = "dual_rag";
const DEFAULT_QUALITY_SCORE: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub profile_id: String,
    pub query: String,
    pub session_id: Option<String>,
    pub concept_id: Option<String>,
    pub subject: Option<String>,
    pub topic: Option<String>,
    pub include_learner_context: bool,
    pub include_academic_sources: bool,
    pub max_learner_results: Option<usize>,
    pub max_academic_results: Option<usize>,
    pub modality_override: Option<Modality>,
}

impl QueryRequest {
    pub fn new(profile_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            profile_id: profile_id.into(),
            query: query.into(),
            session_id: None,
            concept_id: None,
            subject: None,
            topic: None,
            include_learner_context: true,
            include_academic_sources: true,
            max_learner_results: None,
            max_academic_results: None,
            modality_override: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub answer: String,
    pub learner_evidence: Vec<RetrievedEvidence>,
    pub academic_evidence: Vec<RetrievedEvidence>,
    pub gaps_detected: Vec<GapFinding>,
    pub confidence_score: f64,
    pub modality_used: Modality,
    pub sources_cited: Vec<String>,
    pub used_fallback: bool,
}

#[derive(Debug, Clone)]
pub struct ExplainRequest {
    pub profile_id: String,
    pub concept_id: String,
    pub question: Option<String>,
    pub session_id: Option<String>,
    pub modality_override: Option<Modality>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Explanation {
    pub concept_id: String,
    pub concept_name: String,
    pub explanation: String,
    pub modality_used: Modality,
    pub sources: Vec<String>,
    pub gaps_detected: Vec<GapFinding>,
    pub follow_up_questions: Vec<String>,
    pub confidence_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchSource {
    Learner,
    Academic,
    All,
}

impl SearchSource {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "learner" | "student" => Some(SearchSource::Learner),
            "academic" => Some(SearchSource::Academic),
            "all" | "both" => Some(SearchSource::All),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub query: String,
    pub source: SearchSource,
    pub subject: Option<String>,
    pub topic: Option<String>,
    pub limit: usize,
    pub profile_id: Option<String>,
}

/// Runs an external call under a deadline; the caller decides what a miss means.
async fn bounded<T, E, F>(deadline: Duration, fut: F) -> std::result::Result<T, String>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("timed out after {:?}", deadline)),
    }
}

fn scope_filter(subject: Option<&str>, topic: Option<&str>) -> Metadata {
    let mut filter = Metadata::new();
    if let Some(s) = subject {
        filter.insert("subject".to_string(), s.to_string());
    }
    if let Some(t) = topic {
        filter.insert("topic".to_string(), t.to_string());
    }
    filter
}

fn insert_opt(metadata: &mut Metadata, key: &str, value: Option<&str>) {
    if let Some(v) = value {
        metadata.insert(key.to_string(), v.to_string());
    }
}

fn evidence_kind(collection: Collection) -> EvidenceKind {
    match collection {
        Collection::LearnerHistory => EvidenceKind::Learner,
        Collection::Academic => EvidenceKind::Academic,
    }
}

fn distinct_sources(academic: &[RetrievedEvidence]) -> Vec<String> {
    let mut sources: Vec<String> = Vec::new();
    for item in academic.iter().take(CITED_SOURCES) {
        let name = item.source_name().unwrap_or("Unknown").to_string();
        if !sources.contains(&name) {
            sources.push(name);
        }
    }
    sources
}

#[derive(Clone)]
pub struct FusionEngine {
    db: Arc<Database>,
    mastery: MasteryEngine,
    index: Arc<dyn EvidenceIndex>,
    generator: Arc<dyn TextGenerator>,
    settings: FusionSettings,
}

impl FusionEngine {
    pub fn new(
        db: Arc<Database>,
        index: Arc<dyn EvidenceIndex>,
        generator: Arc<dyn TextGenerator>,
        settings: FusionSettings,
    ) -> Self {
        Self {
            mastery: MasteryEngine::new(db.clone()),
            db,
            index,
            generator,
            settings,
        }
    }

    pub fn mastery(&self) -> &MasteryEngine {
        &self.mastery
    }

    // Learner-history ingestion

    pub async fn add_learner_context(&self, profile_id: &str, new: NewLearnerContext) -> Result<LearnerEvidence> {
        if new.content.trim().is_empty() {
            return Err(FusionError::Validation("learner context content is empty".into()));
        }
        if let Some(c) = new.confidence_score {
            if !(0.0..=1.0).contains(&c) {
                return Err(FusionError::Validation(format!("confidence {} outside [0, 1]", c)));
            }
        }

        let mut evidence = LearnerEvidence {
            id: Uuid::new_v4().to_string(),
            profile_id: profile_id.to_string(),
            context_type: new.context_type,
            content: new.content,
            concept_id: new.concept_id,
            concept_name: new.concept_name,
            subject: new.subject,
            topic: new.topic,
            tags: new.tags,
            was_correct: new.was_correct,
            confidence_score: new.confidence_score,
            index_ref: None,
            created_at: Utc::now(),
        };
        self.db.insert_learner_evidence(&evidence)?;

        let mut metadata = Metadata::new();
        metadata.insert("profile_id".into(), evidence.profile_id.clone());
        metadata.insert("context_type".into(), evidence.context_type.as_str().into());
        metadata.insert("created_at".into(), evidence.created_at.to_rfc3339());
        insert_opt(&mut metadata, "concept_id", evidence.concept_id.as_deref());
        insert_opt(&mut metadata, "concept_name", evidence.concept_name.as_deref());
        insert_opt(&mut metadata, "subject", evidence.subject.as_deref());
        insert_opt(&mut metadata, "topic", evidence.topic.as_deref());
        if let Some(correct) = evidence.was_correct {
            metadata.insert("was_correct".into(), correct.to_string());
        }

        let index_ref = self
            .index
            .index(Collection::LearnerHistory, &evidence.id, &evidence.content, &metadata)
            .await?;
        self.db.set_learner_evidence_ref(&evidence.id, &index_ref)?;
        evidence.index_ref = Some(index_ref);

        debug!(profile_id = %profile_id, evidence_id = %evidence.id, "stored learner context");
        Ok(evidence)
    }

    pub fn recent_learner_context(&self, profile_id: &str, limit: usize) -> Result<Vec<LearnerEvidence>> {
        Ok(self.db.recent_learner_evidence(profile_id, limit)?)
    }

    // Academic ingestion

    pub async fn add_academic_document(&self, doc: NewAcademicDocument) -> Result<Vec<AcademicChunk>> {
        if doc.title.trim().is_empty() {
            return Err(FusionError::Validation("document title is empty".into()));
        }
        if !(1..=10).contains(&doc.difficulty) {
            return Err(FusionError::Validation(format!(
                "difficulty {} outside 1-10",
                doc.difficulty
            )));
        }
        let pieces = chunk_text(&doc.content, self.settings.chunk_chars);
        if pieces.is_empty() {
            return Err(FusionError::Validation("document content is empty".into()));
        }

        let document_id = Uuid::new_v4().to_string();
        let total_chunks = pieces.len() as i64;
        let mut chunks = Vec::with_capacity(pieces.len());

        for (chunk_index, content) in pieces.into_iter().enumerate() {
            let mut chunk = AcademicChunk {
                id: Uuid::new_v4().to_string(),
                document_id: document_id.clone(),
                title: doc.title.clone(),
                source_type: doc.source_type,
                source_name: doc.source_name.clone(),
                content,
                chunk_index: chunk_index as i64,
                total_chunks,
                subject: doc.subject.clone(),
                topic: doc.topic.clone(),
                subtopic: doc.subtopic.clone(),
                grade_level: doc.grade_level.clone(),
                tags: doc.tags.clone(),
                difficulty: doc.difficulty,
                is_verified: false,
                quality_score: DEFAULT_QUALITY_SCORE,
                index_ref: None,
                created_at: Utc::now(),
            };
            self.db.insert_academic_chunk(&chunk)?;

            let mut metadata = Metadata::new();
            metadata.insert("document_id".into(), chunk.document_id.clone());
            metadata.insert("title".into(), chunk.title.clone());
            metadata.insert("source_type".into(), chunk.source_type.as_str().into());
            metadata.insert("source_name".into(), chunk.source_name.clone());
            metadata.insert("subject".into(), chunk.subject.clone());
            metadata.insert("topic".into(), chunk.topic.clone());
            metadata.insert("difficulty_level".into(), chunk.difficulty.to_string());
            metadata.insert("chunk_index".into(), chunk.chunk_index.to_string());
            insert_opt(&mut metadata, "subtopic", chunk.subtopic.as_deref());
            insert_opt(&mut metadata, "grade_level", chunk.grade_level.as_deref());

            let index_ref = self
                .index
                .index(Collection::Academic, &chunk.id, &chunk.content, &metadata)
                .await?;
            self.db.mark_chunk_indexed(&chunk.id, &index_ref)?;
            chunk.index_ref = Some(index_ref);
            chunk.is_verified = true;
            chunks.push(chunk);
        }

        info!(
            document_id = %document_id,
            title = %doc.title,
            chunks = chunks.len(),
            "ingested academic document"
        );
        Ok(chunks)
    }

    /// Sequential; documents ingested before a failure stay committed.
    pub async fn add_academic_documents_bulk(&self, docs: Vec<NewAcademicDocument>) -> Result<Vec<AcademicChunk>> {
        let mut all = Vec::new();
        for doc in docs {
            all.extend(self.add_academic_document(doc).await?);
        }
        Ok(all)
    }

    pub fn list_academic_documents(
        &self,
        subject: Option<&str>,
        topic: Option<&str>,
        limit: usize,
    ) -> Result<Vec<AcademicChunk>> {
        Ok(self.db.list_academic_chunks(subject, topic, limit)?)
    }

    /// Removes every chunk of the document from the index and marks the
    /// records unverified. Returns the number of index entries removed.
    pub async fn retract_academic_document(&self, document_id: &str) -> Result<usize> {
        let chunks = self.db.chunks_for_document(document_id)?;
        if chunks.is_empty() {
            return Err(FusionError::DocumentNotFound(document_id.to_string()));
        }

        let mut removed = 0;
        for chunk in &chunks {
            if self.index.delete(Collection::Academic, &chunk.id).await? {
                removed += 1;
            }
            self.db.set_academic_chunk_ref(&chunk.id, None)?;
        }
        self.db.mark_document_unverified(document_id)?;

        info!(document_id = %document_id, removed, "retracted academic document");
        Ok(removed)
    }

    // Query pipeline

    pub async fn query(&self, request: QueryRequest) -> Result<QueryResponse> {
        let query = request.query.trim();
        if query.is_empty() {
            return Err(FusionError::Validation("query is empty".into()));
        }

        let profile = match self.mastery.find_profile(&request.profile_id) {
            Ok(p) => p,
            Err(e) => {
                warn!(profile_id = %request.profile_id, error = %e, "profile lookup failed, answering anonymously");
                None
            }
        };
        if profile.is_none() {
            debug!(profile_id = %request.profile_id, "no profile, using default personalization");
        }
        let modality = request.modality_override.unwrap_or_else(|| {
            profile
                .as_ref()
                .map(|p| p.modality_preferences.preferred())
                .unwrap_or_default()
        });

        let scope = scope_filter(request.subject.as_deref(), request.topic.as_deref());
        let mut learner_filter = scope.clone();
        learner_filter.insert("profile_id".into(), request.profile_id.clone());

        let learner_k = if request.include_learner_context {
            request.max_learner_results.unwrap_or(self.settings.top_k_learner)
        } else {
            0
        };
        let academic_k = if request.include_academic_sources {
            request.max_academic_results.unwrap_or(self.settings.top_k_academic)
        } else {
            0
        };

        let (learner, academic) = tokio::join!(
            self.retrieve(Collection::LearnerHistory, query, learner_k, &learner_filter),
            self.retrieve(Collection::Academic, query, academic_k, &scope),
        );

        let gaps = if !learner.is_empty() && !academic.is_empty() {
            self.detect_gaps(&request, query, profile.is_some(), &learner, &academic).await
        } else {
            Vec::new()
        };

        let (answer, confidence_score, used_fallback) =
            self.synthesize(query, &learner, &academic, modality, &gaps).await;

        self.write_back(&request, query, &answer, &learner, &academic).await;

        info!(
            profile_id = %request.profile_id,
            learner_hits = learner.len(),
            academic_hits = academic.len(),
            gaps = gaps.len(),
            fallback = used_fallback,
            "answered query"
        );

        Ok(QueryResponse {
            answer,
            sources_cited: distinct_sources(&academic),
            learner_evidence: learner,
            academic_evidence: academic,
            gaps_detected: gaps,
            confidence_score,
            modality_used: modality,
            used_fallback,
        })
    }

    async fn retrieve(&self, collection: Collection, query: &str, k: usize, filter: &Metadata) -> Vec<RetrievedEvidence> {
        if k == 0 {
            return Vec::new();
        }
        match bounded(self.settings.search_timeout, self.index.search(collection, query, k, filter)).await {
            Ok(hits) => hits
                .into_iter()
                .map(|hit| RetrievedEvidence {
                    id: hit.id,
                    kind: evidence_kind(collection),
                    content: hit.text,
                    relevance_score: hit.score,
                    metadata: hit.metadata,
                })
                .collect(),
            Err(e) => {
                warn!(collection = collection.as_str(), error = %e, "retrieval failed, continuing without it");
                Vec::new()
            }
        }
    }

    async fn generate(&self, deadline: Duration, request: GenerationRequest) -> std::result::Result<String, GenerationError> {
        match tokio::time::timeout(deadline, self.generator.complete(request)).await {
            Ok(result) => result,
            Err(_) => Err(GenerationError::Timeout(deadline)),
        }
    }

    async fn detect_gaps(
        &self,
        request: &QueryRequest,
        query: &str,
        has_profile: bool,
        learner: &[RetrievedEvidence],
        academic: &[RetrievedEvidence],
    ) -> Vec<GapFinding> {
        let detected = match self
            .generate(self.settings.gap_timeout, gap_request(query, learner, academic))
            .await
            .and_then(|text| parse_gaps(&text))
        {
            Ok(gaps) => gaps,
            Err(e) => {
                warn!(profile_id = %request.profile_id, error = %e, "gap detection unavailable, assuming no gaps");
                return Vec::new();
            }
        };

        let learner_ids: Vec<String> = learner.iter().map(|e| e.id.clone()).collect();
        let academic_ids: Vec<String> = academic.iter().map(|e| e.id.clone()).collect();

        detected
            .into_iter()
            .map(|gap| self.record_gap(request, has_profile, gap, &learner_ids, &academic_ids))
            .collect()
    }

    fn resolve_concept_id(&self, requested: Option<&str>, concept_name: &str) -> Option<String> {
        if let Some(id) = requested {
            if let Ok(Some(concept)) = self.db.get_concept(id) {
                return Some(concept.id);
            }
        }
        self.db
            .find_concept_by_name(concept_name)
            .ok()
            .flatten()
            .map(|c| c.id)
    }

    fn record_gap(
        &self,
        request: &QueryRequest,
        has_profile: bool,
        gap: DetectedGap,
        learner_ids: &[String],
        academic_ids: &[String],
    ) -> GapFinding {
        let concept_id = self.resolve_concept_id(request.concept_id.as_deref(), &gap.concept_name);

        let mut finding = GapFinding {
            id: Uuid::new_v4().to_string(),
            profile_id: request.profile_id.clone(),
            concept_id: concept_id.clone(),
            concept_name: gap.concept_name,
            learner_belief: gap.learner_belief,
            correct_understanding: gap.correct_understanding,
            description: gap.description,
            severity: gap.severity,
            priority_score: gap.severity.priority(),
            is_resolved: false,
            resolution_strategy: None,
            learner_evidence_ids: learner_ids.to_vec(),
            academic_evidence_ids: academic_ids.to_vec(),
            misconception_id: None,
            detected_at: Utc::now(),
            resolved_at: None,
        };

        if finding.severity.escalates() {
            if has_profile {
                let new = NewMisconception {
                    concept_id,
                    misconception_type: ESCALATED_MISCONCEPTION_TYPE.to_string(),
                    description: finding.description.clone(),
                    learner_belief: finding.learner_belief.clone(),
                    correct_understanding: finding.correct_understanding.clone(),
                    severity: finding.severity.to_misconception_severity(),
                    detection_source: DETECTION_SOURCE.to_string(),
                    learner_evidence_ids: learner_ids.to_vec(),
                    academic_evidence_ids: academic_ids.to_vec(),
                };
                match self.mastery.raise_misconception(&request.profile_id, new) {
                    Ok(m) => finding.misconception_id = Some(m.id),
                    Err(e) => warn!(gap_id = %finding.id, error = %e, "failed to escalate gap"),
                }
            } else {
                warn!(
                    profile_id = %request.profile_id,
                    gap_id = %finding.id,
                    "no profile to own escalated gap, skipping misconception"
                );
            }
        }

        if let Err(e) = self.db.insert_gap(&finding) {
            warn!(gap_id = %finding.id, error = %e, "failed to persist gap finding");
        }
        finding
    }

    async fn synthesize(
        &self,
        query: &str,
        learner: &[RetrievedEvidence],
        academic: &[RetrievedEvidence],
        modality: Modality,
        gaps: &[GapFinding],
    ) -> (String, f64, bool) {
        let request = synthesis_request(query, learner, academic, modality, gaps);
        match self.generate(self.settings.synthesis_timeout, request).await {
            Ok(text) if !text.trim().is_empty() => (text, SYNTHESIS_CONFIDENCE, false),
            Ok(_) => {
                warn!("synthesis returned empty text, using template answer");
                (fallback_answer(query, learner, academic), FALLBACK_CONFIDENCE, true)
            }
            Err(e) => {
                warn!(error = %e, "synthesis unavailable, using template answer");
                (fallback_answer(query, learner, academic), FALLBACK_CONFIDENCE, true)
            }
        }
    }

    async fn write_back(
        &self,
        request: &QueryRequest,
        query: &str,
        answer: &str,
        learner: &[RetrievedEvidence],
        academic: &[RetrievedEvidence],
    ) {
        if let Some(session_id) = &request.session_id {
            let now = Utc::now();
            let user_turn = ChatTurn {
                id: Uuid::new_v4().to_string(),
                profile_id: request.profile_id.clone(),
                session_id: session_id.clone(),
                role: ChatRole::User,
                content: query.to_string(),
                concept_id: request.concept_id.clone(),
                learner_evidence_ids: vec![],
                academic_evidence_ids: vec![],
                was_helpful: None,
                created_at: now,
            };
            let assistant_turn = ChatTurn {
                id: Uuid::new_v4().to_string(),
                role: ChatRole::Assistant,
                content: answer.to_string(),
                learner_evidence_ids: learner.iter().map(|e| e.id.clone()).collect(),
                academic_evidence_ids: academic.iter().map(|e| e.id.clone()).collect(),
                created_at: now,
                ..user_turn.clone()
            };
            for turn in [&user_turn, &assistant_turn] {
                if let Err(e) = self.db.insert_chat_turn(turn) {
                    warn!(session_id = %session_id, error = %e, "failed to append chat turn");
                }
            }
        }

        let mut context = NewLearnerContext::new(
            ContextType::Chat,
            format!(
                "Q: {}\nA: {}",
                truncate_chars(query, WRITE_BACK_QUERY_CHARS),
                truncate_chars(answer, WRITE_BACK_ANSWER_CHARS)
            ),
        );
        context.concept_id = request.concept_id.clone();
        context.subject = request.subject.clone();
        context.topic = request.topic.clone();

        if let Err(e) = self.add_learner_context(&request.profile_id, context).await {
            warn!(profile_id = %request.profile_id, error = %e, "failed to write back interaction");
        }
    }

    // Gap feedback loop

    pub fn unresolved_gaps(&self, profile_id: &str) -> Result<Vec<GapFinding>> {
        Ok(self.db.unresolved_gaps(profile_id)?)
    }

    /// Idempotent; a second call keeps the first resolution time.
    pub fn resolve_gap(&self, gap_id: &str, strategy: &str) -> Result<GapFinding> {
        if strategy.trim().is_empty() {
            return Err(FusionError::Validation("resolution strategy is empty".into()));
        }
        if !self.db.resolve_gap(gap_id, strategy, Utc::now())? {
            return Err(FusionError::GapNotFound(gap_id.to_string()));
        }
        self.db
            .get_gap(gap_id)?
            .ok_or_else(|| FusionError::GapNotFound(gap_id.to_string()))
    }

    // Chat log

    pub fn chat_history(&self, profile_id: &str, session_id: Option<&str>, limit: usize) -> Result<Vec<ChatTurn>> {
        Ok(self.db.chat_history(profile_id, session_id, limit)?)
    }

    pub fn submit_feedback(&self, message_id: &str, helpful: bool) -> Result<()> {
        if !self.db.set_chat_feedback(message_id, helpful)? {
            return Err(FusionError::MessageNotFound(message_id.to_string()));
        }
        Ok(())
    }

    // Helpers over the pipeline

    pub async fn explain_concept(&self, request: ExplainRequest) -> Result<Explanation> {
        let concept = self
            .db
            .get_concept(&request.concept_id)?
            .ok_or_else(|| FusionError::ConceptNotFound(request.concept_id.clone()))?;

        let question = request
            .question
            .filter(|q| !q.trim().is_empty())
            .unwrap_or_else(|| format!("Explain {} in detail", concept.name));

        let response = self
            .query(QueryRequest {
                session_id: request.session_id,
                concept_id: Some(concept.id.clone()),
                subject: Some(concept.subject.clone()),
                topic: Some(concept.topic.clone()),
                modality_override: request.modality_override,
                ..QueryRequest::new(request.profile_id, question)
            })
            .await?;

        Ok(Explanation {
            follow_up_questions: follow_up_questions(&concept.name),
            concept_id: concept.id,
            concept_name: concept.name,
            explanation: response.answer,
            modality_used: response.modality_used,
            sources: response.sources_cited,
            gaps_detected: response.gaps_detected,
            confidence_score: response.confidence_score,
        })
    }

    /// Direct index search; unlike the query path, index failures propagate.
    pub async fn semantic_search(&self, search: SearchQuery) -> Result<Vec<RetrievedEvidence>> {
        if search.query.trim().is_empty() {
            return Err(FusionError::Validation("search query is empty".into()));
        }
        if search.source == SearchSource::Learner && search.profile_id.is_none() {
            return Err(FusionError::Validation("learner search requires a profile".into()));
        }

        let scope = scope_filter(search.subject.as_deref(), search.topic.as_deref());
        let mut results = Vec::new();

        if search.source != SearchSource::Academic {
            if let Some(profile_id) = &search.profile_id {
                let mut filter = scope.clone();
                filter.insert("profile_id".into(), profile_id.clone());
                results.extend(self.search_collection(Collection::LearnerHistory, &search.query, search.limit, &filter).await?);
            }
        }
        if search.source != SearchSource::Learner {
            results.extend(self.search_collection(Collection::Academic, &search.query, search.limit, &scope).await?);
        }

        results.sort_by(|a, b| {
            b.relevance_score
                .partial_cmp(&a.relevance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(search.limit);
        Ok(results)
    }

    async fn search_collection(
        &self,
        collection: Collection,
        query: &str,
        k: usize,
        filter: &Metadata,
    ) -> std::result::Result<Vec<RetrievedEvidence>, IndexError> {
        let hits = self.index.search(collection, query, k, filter).await?;
        Ok(hits
            .into_iter()
            .map(|hit| RetrievedEvidence {
                id: hit.id,
                kind: evidence_kind(collection),
                content: hit.text,
                relevance_score: hit.score,
                metadata: hit.metadata,
            })
            .collect())
    }

    pub async fn index_stats(&self) -> Result<IndexStats> {
        Ok(IndexStats {
            learner_history: self.index.stats(Collection::LearnerHistory).await?,
            academic: self.index.stats(Collection::Academic).await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::OutputMode;
    use crate::index::{HashingEmbedder, SqliteEvidenceIndex};
    use crate::models::{GapSeverity, MisconceptionSeverity, NewConcept, SessionType, SourceType};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    const FRICTION_GAP: &str = r#"{"gaps": [{
        "concept_name": "Friction",
        "student_understanding": "kinetic friction is always greater than static friction",
        "correct_understanding": "static friction is generally greater than kinetic friction",
        "gap_description": "ordering of static and kinetic friction is reversed",
        "severity": "significant"
    }]}"#;

    /// Replies from a fixed script and records every request it sees.
    struct ScriptedGenerator {
        gaps: String,
        answer: String,
        seen: Mutex<Vec<GenerationRequest>>,
    }

    impl ScriptedGenerator {
        fn new(gaps: &str, answer: &str) -> Self {
            Self {
                gaps: gaps.to_string(),
                answer: answer.to_string(),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TextGenerator for ScriptedGenerator {
        async fn complete(&self, request: GenerationRequest) -> std::result::Result<String, GenerationError> {
            let reply = match request.mode {
                OutputMode::Json => self.gaps.clone(),
                OutputMode::Text => self.answer.clone(),
            };
            self.seen.lock().push(request);
            Ok(reply)
        }
    }

    struct FailingGenerator;

    #[async_trait]
    impl TextGenerator for FailingGenerator {
        async fn complete(&self, _request: GenerationRequest) -> std::result::Result<String, GenerationError> {
            Err(GenerationError::NotConfigured("LLM_API_KEY"))
        }
    }

    struct HangingGenerator;

    #[async_trait]
    impl TextGenerator for HangingGenerator {
        async fn complete(&self, _request: GenerationRequest) -> std::result::Result<String, GenerationError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok("too late".to_string())
        }
    }

    struct UnavailableIndex;

    #[async_trait]
    impl EvidenceIndex for UnavailableIndex {
        async fn index(
            &self,
            _collection: Collection,
            _id: &str,
            _text: &str,
            _metadata: &Metadata,
        ) -> std::result::Result<String, IndexError> {
            Err(IndexError::Unavailable("offline".to_string()))
        }

        async fn search(
            &self,
            _collection: Collection,
            _query: &str,
            _k: usize,
            _filter: &Metadata,
        ) -> std::result::Result<Vec<crate::index::SearchHit>, IndexError> {
            Err(IndexError::Unavailable("offline".to_string()))
        }

        async fn delete(&self, _collection: Collection, _id: &str) -> std::result::Result<bool, IndexError> {
            Ok(false)
        }

        async fn stats(&self, _collection: Collection) -> std::result::Result<usize, IndexError> {
            Ok(0)
        }
    }

    fn fast_settings() -> FusionSettings {
        FusionSettings {
            search_timeout: Duration::from_secs(5),
            gap_timeout: Duration::from_millis(50),
            synthesis_timeout: Duration::from_millis(50),
            ..FusionSettings::default()
        }
    }

    fn setup_engine(generator: Arc<dyn TextGenerator>) -> FusionEngine {
        let db = Arc::new(Database::open(":memory:").expect("Failed to open in-memory database"));
        db.init().expect("Failed to initialize schema");
        let index = SqliteEvidenceIndex::open(":memory:", Arc::new(HashingEmbedder::default()))
            .expect("Failed to open in-memory index");
        FusionEngine::new(db, Arc::new(index), generator, fast_settings())
    }

    fn physics_doc(title: &str, source: &str, content: &str) -> NewAcademicDocument {
        NewAcademicDocument {
            title: title.to_string(),
            source_type: SourceType::Textbook,
            source_name: source.to_string(),
            content: content.to_string(),
            subject: "physics".to_string(),
            topic: "mechanics".to_string(),
            subtopic: None,
            grade_level: None,
            tags: vec![],
            difficulty: 5,
        }
    }

    async fn seed_newton(engine: &FusionEngine) -> Vec<AcademicChunk> {
        engine
            .add_academic_document(physics_doc(
                "Newton's Laws",
                "OpenStax Physics",
                "Newton's second law states that force equals mass times acceleration.",
            ))
            .await
            .unwrap()
    }

    mod scenario_tests {
        use super::*;

        #[tokio::test]
        async fn new_learner_gets_academic_only_answer() {
            let generator = Arc::new(ScriptedGenerator::new(r#"{"gaps": []}"#, "F = ma, explained."));
            let engine = setup_engine(generator.clone());
            let profile = engine.mastery().create_profile("alice").unwrap();
            seed_newton(&engine).await;

            let response = engine
                .query(QueryRequest::new(&profile.id, "Explain Newton's Second Law"))
                .await
                .unwrap();

            assert!(response.learner_evidence.is_empty());
            assert_eq!(response.academic_evidence.len(), 1);
            assert_eq!(response.modality_used, Modality::Visual);
            assert!(response.gaps_detected.is_empty());
            assert_eq!(response.answer, "F = ma, explained.");
            assert_eq!(response.confidence_score, SYNTHESIS_CONFIDENCE);
            assert_eq!(response.sources_cited, vec!["OpenStax Physics".to_string()]);

            // No learner hits, so only synthesis was requested
            let seen = generator.seen.lock();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].mode, OutputMode::Text);
            assert!(seen[0].user.contains("No previous context available."));
            assert!(seen[0].user.contains("[OpenStax Physics]"));
        }

        #[tokio::test]
        async fn significant_gap_becomes_misconception() {
            let generator = Arc::new(ScriptedGenerator::new(FRICTION_GAP, "Static friction is usually larger."));
            let engine = setup_engine(generator);
            let profile = engine.mastery().create_profile("bob").unwrap();
            let concept = engine
                .mastery()
                .create_concept(NewConcept {
                    name: "Friction".into(),
                    subject: "physics".into(),
                    topic: "mechanics".into(),
                    difficulty: 4,
                    ..Default::default()
                })
                .unwrap();

            let belief = engine
                .add_learner_context(
                    &profile.id,
                    NewLearnerContext::new(
                        ContextType::Assessment,
                        "kinetic friction is always greater than static friction",
                    ),
                )
                .await
                .unwrap();
            let chunks = engine
                .add_academic_document(physics_doc(
                    "Friction",
                    "Physics 101",
                    "Static friction is generally greater than kinetic friction for the same surfaces.",
                ))
                .await
                .unwrap();

            let response = engine
                .query(QueryRequest::new(&profile.id, "Which is greater, static or kinetic friction?"))
                .await
                .unwrap();

            assert_eq!(response.gaps_detected.len(), 1);
            let gap = &response.gaps_detected[0];
            assert_eq!(gap.severity, GapSeverity::Significant);
            assert_eq!(gap.concept_id.as_deref(), Some(concept.id.as_str()));
            assert!(gap.misconception_id.is_some());

            let active = engine.mastery().active_misconceptions(&profile.id).unwrap();
            assert_eq!(active.len(), 1);
            let m = &active[0];
            assert_eq!(m.severity, MisconceptionSeverity::High);
            assert_eq!(m.detection_source, "dual_rag");
            assert_eq!(m.misconception_type, "knowledge_gap");
            assert_eq!(m.concept_id.as_deref(), Some(concept.id.as_str()));
            assert!(m.learner_evidence_ids.contains(&belief.id));
            assert!(m.academic_evidence_ids.contains(&chunks[0].id));

            let stored = engine.unresolved_gaps(&profile.id).unwrap();
            assert_eq!(stored.len(), 1);
            assert_eq!(stored[0].misconception_id, gap.misconception_id);
        }

        #[tokio::test]
        async fn failing_generator_falls_back_to_template() {
            let engine = setup_engine(Arc::new(FailingGenerator));
            let profile = engine.mastery().create_profile("carol").unwrap();
            seed_newton(&engine).await;

            let response = engine
                .query(QueryRequest::new(&profile.id, "Explain Newton's Second Law"))
                .await
                .unwrap();

            assert!(response.used_fallback);
            assert_eq!(response.confidence_score, FALLBACK_CONFIDENCE);
            assert!(response.answer.starts_with("Based on your question about \"Explain Newton's Second Law\""));
            assert!(response
                .answer
                .contains("Newton's second law states that force equals mass times acceleration."));
        }
    }

    mod degradation_tests {
        use super::*;

        #[tokio::test]
        async fn hanging_generator_times_out_to_template_without_gaps() {
            let engine = setup_engine(Arc::new(HangingGenerator));
            let profile = engine.mastery().create_profile("dave").unwrap();
            engine
                .add_learner_context(
                    &profile.id,
                    NewLearnerContext::new(ContextType::Question, "I think mass and weight are the same"),
                )
                .await
                .unwrap();
            engine
                .add_academic_document(physics_doc("Mass", "Physics 101", "Mass is not the same as weight."))
                .await
                .unwrap();

            let response = engine
                .query(QueryRequest::new(&profile.id, "Are mass and weight the same?"))
                .await
                .unwrap();

            assert!(response.used_fallback);
            assert!(response.gaps_detected.is_empty());
            assert!(engine.unresolved_gaps(&profile.id).unwrap().is_empty());
        }

        #[tokio::test]
        async fn malformed_gap_output_means_no_gaps() {
            let engine = setup_engine(Arc::new(ScriptedGenerator::new("no gaps here, friend", "answer")));
            let profile = engine.mastery().create_profile("erin").unwrap();
            engine
                .add_learner_context(&profile.id, NewLearnerContext::new(ContextType::Question, "what is torque"))
                .await
                .unwrap();
            engine
                .add_academic_document(physics_doc("Torque", "Physics 101", "Torque is a rotational force."))
                .await
                .unwrap();

            let response = engine.query(QueryRequest::new(&profile.id, "torque")).await.unwrap();
            assert!(response.gaps_detected.is_empty());
            assert!(!response.used_fallback);
        }

        #[tokio::test]
        async fn anonymous_query_answers_without_escalation() {
            let engine = setup_engine(Arc::new(ScriptedGenerator::new(FRICTION_GAP, "answer")));
            engine
                .add_learner_context(
                    "ghost",
                    NewLearnerContext::new(ContextType::Question, "kinetic friction beats static friction"),
                )
                .await
                .unwrap();
            engine
                .add_academic_document(physics_doc("Friction", "Physics 101", "Static friction exceeds kinetic friction."))
                .await
                .unwrap();

            let response = engine.query(QueryRequest::new("ghost", "static vs kinetic friction")).await.unwrap();

            assert_eq!(response.modality_used, Modality::Visual);
            assert_eq!(response.gaps_detected.len(), 1);
            assert!(response.gaps_detected[0].misconception_id.is_none());
            // Interaction is still recorded under the supplied id
            assert_eq!(engine.recent_learner_context("ghost", 10).unwrap().len(), 2);
        }

        #[tokio::test]
        async fn disabled_retrievals_are_skipped() {
            let engine = setup_engine(Arc::new(FailingGenerator));
            let profile = engine.mastery().create_profile("fay").unwrap();
            seed_newton(&engine).await;

            let response = engine
                .query(QueryRequest {
                    include_academic_sources: false,
                    ..QueryRequest::new(&profile.id, "Newton's second law")
                })
                .await
                .unwrap();

            assert!(response.academic_evidence.is_empty());
            assert!(response.sources_cited.is_empty());
            assert!(response.answer.contains("No sources available."));
        }

        #[tokio::test]
        async fn empty_query_is_rejected() {
            let engine = setup_engine(Arc::new(FailingGenerator));
            let err = engine.query(QueryRequest::new("p", "   ")).await.unwrap_err();
            assert!(matches!(err, FusionError::Validation(_)));
        }
    }

    mod personalization_tests {
        use super::*;

        #[tokio::test]
        async fn preferred_modality_drives_synthesis() {
            let generator = Arc::new(ScriptedGenerator::new(r#"{"gaps": []}"#, "answer"));
            let engine = setup_engine(generator.clone());
            let profile = engine.mastery().create_profile("gina").unwrap();
            engine
                .mastery()
                .adjust_modality_preference(&profile.id, "analogy", true, 0.1)
                .unwrap();

            let response = engine.query(QueryRequest::new(&profile.id, "What is inertia?")).await.unwrap();
            assert_eq!(response.modality_used, Modality::Analogy);
            assert!(generator.seen.lock()[0].system.contains("Learning Style Preference: analogy"));

            let response = engine
                .query(QueryRequest {
                    modality_override: Some(Modality::Interactive),
                    ..QueryRequest::new(&profile.id, "What is inertia?")
                })
                .await
                .unwrap();
            assert_eq!(response.modality_used, Modality::Interactive);
        }

        #[tokio::test]
        async fn learner_retrieval_is_scoped_to_profile() {
            let engine = setup_engine(Arc::new(FailingGenerator));
            let a = engine.mastery().create_profile("a").unwrap();
            let b = engine.mastery().create_profile("b").unwrap();
            engine
                .add_learner_context(&a.id, NewLearnerContext::new(ContextType::Question, "momentum is mass times velocity"))
                .await
                .unwrap();

            let response = engine.query(QueryRequest::new(&b.id, "momentum")).await.unwrap();
            assert!(response.learner_evidence.is_empty());
        }
    }

    mod write_back_tests {
        use super::*;

        #[tokio::test]
        async fn interaction_is_written_back_with_chat_turns() {
            let engine = setup_engine(Arc::new(ScriptedGenerator::new(r#"{"gaps": []}"#, "F = ma.")));
            let profile = engine.mastery().create_profile("hal").unwrap();
            let session = engine
                .mastery()
                .start_session(&profile.id, SessionType::Chat, vec![])
                .unwrap();
            let chunks = seed_newton(&engine).await;

            engine
                .query(QueryRequest {
                    session_id: Some(session.id.clone()),
                    subject: Some("physics".into()),
                    ..QueryRequest::new(&profile.id, "What is Newton's second law?")
                })
                .await
                .unwrap();

            let history = engine.recent_learner_context(&profile.id, 5).unwrap();
            assert_eq!(history.len(), 1);
            assert_eq!(history[0].context_type, ContextType::Chat);
            assert_eq!(history[0].content, "Q: What is Newton's second law?\nA: F = ma.");
            assert_eq!(history[0].subject.as_deref(), Some("physics"));
            assert!(history[0].index_ref.is_some());

            let turns = engine.chat_history(&profile.id, Some(&session.id), 10).unwrap();
            assert_eq!(turns.len(), 2);
            let assistant = turns.iter().find(|t| t.role == ChatRole::Assistant).unwrap();
            assert_eq!(assistant.content, "F = ma.");
            assert_eq!(assistant.academic_evidence_ids, vec![chunks[0].id.clone()]);

            // The written-back interaction is retrievable next time
            let response = engine
                .query(QueryRequest::new(&profile.id, "Newton's second law again"))
                .await
                .unwrap();
            assert_eq!(response.learner_evidence.len(), 1);
        }

        #[tokio::test]
        async fn long_query_is_truncated_on_write_back() {
            let engine = setup_engine(Arc::new(FailingGenerator));
            let profile = engine.mastery().create_profile("lee").unwrap();
            let query = "why ".repeat(1000);
            engine.query(QueryRequest::new(&profile.id, query.as_str())).await.unwrap();

            let history = engine.recent_learner_context(&profile.id, 5).unwrap();
            assert_eq!(history.len(), 1);
            let stored_query = history[0]
                .content
                .strip_prefix("Q: ")
                .and_then(|rest| rest.split("\nA: ").next())
                .unwrap();
            assert_eq!(stored_query.chars().count(), WRITE_BACK_QUERY_CHARS);
            assert!(history[0].content.chars().count() <= WRITE_BACK_QUERY_CHARS + WRITE_BACK_ANSWER_CHARS + 7);
        }

        #[tokio::test]
        async fn no_session_means_no_chat_turns() {
            let engine = setup_engine(Arc::new(FailingGenerator));
            let profile = engine.mastery().create_profile("ivy").unwrap();
            engine.query(QueryRequest::new(&profile.id, "What is work?")).await.unwrap();

            assert!(engine.chat_history(&profile.id, None, 10).unwrap().is_empty());
            assert_eq!(engine.recent_learner_context(&profile.id, 10).unwrap().len(), 1);
        }

        #[tokio::test]
        async fn feedback_marks_turn() {
            let engine = setup_engine(Arc::new(FailingGenerator));
            let profile = engine.mastery().create_profile("jo").unwrap();
            engine
                .query(QueryRequest {
                    session_id: Some("s1".into()),
                    ..QueryRequest::new(&profile.id, "What is power?")
                })
                .await
                .unwrap();

            let turns = engine.chat_history(&profile.id, Some("s1"), 10).unwrap();
            engine.submit_feedback(&turns[0].id, true).unwrap();
            let turns = engine.chat_history(&profile.id, Some("s1"), 10).unwrap();
            assert!(turns.iter().any(|t| t.was_helpful == Some(true)));

            assert!(matches!(
                engine.submit_feedback("missing", false),
                Err(FusionError::MessageNotFound(_))
            ));
        }
    }

    mod ingestion_tests {
        use super::*;

        #[tokio::test]
        async fn long_document_is_chunked() {
            let engine = setup_engine(Arc::new(FailingGenerator));
            let paragraph = "Energy is conserved in a closed system. ".repeat(20);
            let content = format!("{}\n\n{}\n\n{}", paragraph, paragraph, paragraph);
            let chunks = engine
                .add_academic_document(physics_doc("Energy", "Physics 101", &content))
                .await
                .unwrap();

            assert!(chunks.len() > 1);
            assert!(chunks.iter().all(|c| c.document_id == chunks[0].document_id));
            assert!(chunks.iter().all(|c| c.total_chunks == chunks.len() as i64));
            for (i, c) in chunks.iter().enumerate() {
                assert_eq!(c.chunk_index, i as i64);
                assert_eq!(c.index_ref.as_deref(), Some(format!("academic:{}", c.id).as_str()));
            }
            assert_eq!(engine.index_stats().await.unwrap().academic, chunks.len());
        }

        #[tokio::test]
        async fn invalid_documents_are_rejected() {
            let engine = setup_engine(Arc::new(FailingGenerator));
            let mut doc = physics_doc("Empty", "S", "   ");
            assert!(matches!(
                engine.add_academic_document(doc.clone()).await,
                Err(FusionError::Validation(_))
            ));
            doc.content = "text".into();
            doc.difficulty = 11;
            assert!(matches!(
                engine.add_academic_document(doc).await,
                Err(FusionError::Validation(_))
            ));
        }

        #[tokio::test]
        async fn bulk_add_is_sequential() {
            let engine = setup_engine(Arc::new(FailingGenerator));
            let docs = vec![
                physics_doc("A", "S", "first document"),
                physics_doc("B", "S", "second document"),
            ];
            let chunks = engine.add_academic_documents_bulk(docs).await.unwrap();
            assert_eq!(chunks.len(), 2);
            assert_eq!(engine.list_academic_documents(Some("physics"), None, 10).unwrap().len(), 2);
            assert!(engine.list_academic_documents(Some("biology"), None, 10).unwrap().is_empty());
        }

        #[tokio::test]
        async fn retracted_document_is_no_longer_retrieved() {
            let engine = setup_engine(Arc::new(FailingGenerator));
            let chunks = seed_newton(&engine).await;
            let document_id = chunks[0].document_id.clone();

            assert_eq!(engine.retract_academic_document(&document_id).await.unwrap(), 1);
            assert_eq!(engine.index_stats().await.unwrap().academic, 0);

            let listed = engine.list_academic_documents(None, None, 10).unwrap();
            assert_eq!(listed.len(), 1);
            assert!(!listed[0].is_verified);
            assert!(listed[0].index_ref.is_none());

            let response = engine.query(QueryRequest::new("p", "Newton's second law")).await.unwrap();
            assert!(response.academic_evidence.is_empty());

            assert!(matches!(
                engine.retract_academic_document("nope").await,
                Err(FusionError::DocumentNotFound(_))
            ));
        }

        #[tokio::test]
        async fn unindexed_chunk_is_not_listed_as_verified() {
            let db = Arc::new(Database::open(":memory:").expect("Failed to open in-memory database"));
            db.init().expect("Failed to initialize schema");
            let engine = FusionEngine::new(
                db,
                Arc::new(UnavailableIndex),
                Arc::new(FailingGenerator),
                fast_settings(),
            );

            let result = engine
                .add_academic_document(physics_doc("Newton's Laws", "OpenStax Physics", "F = ma."))
                .await;
            assert!(matches!(result, Err(FusionError::Index(_))));

            let listed = engine.list_academic_documents(None, None, 10).unwrap();
            assert_eq!(listed.len(), 1);
            assert!(!listed[0].is_verified);
            assert!(listed[0].index_ref.is_none());
        }

        #[tokio::test]
        async fn ingested_chunks_are_verified() {
            let engine = setup_engine(Arc::new(FailingGenerator));
            let chunks = seed_newton(&engine).await;
            assert!(chunks[0].is_verified);
            assert!(engine.list_academic_documents(None, None, 10).unwrap()[0].is_verified);
        }

        #[tokio::test]
        async fn learner_context_validation() {
            let engine = setup_engine(Arc::new(FailingGenerator));
            let mut ctx = NewLearnerContext::new(ContextType::Question, "");
            assert!(engine.add_learner_context("p", ctx.clone()).await.is_err());
            ctx.content = "something".into();
            ctx.confidence_score = Some(1.5);
            assert!(matches!(
                engine.add_learner_context("p", ctx).await,
                Err(FusionError::Validation(_))
            ));
        }
    }

    mod gap_loop_tests {
        use super::*;

        #[tokio::test]
        async fn resolve_gap_is_idempotent() {
            let engine = setup_engine(Arc::new(ScriptedGenerator::new(FRICTION_GAP, "answer")));
            let profile = engine.mastery().create_profile("kim").unwrap();
            engine
                .add_learner_context(&profile.id, NewLearnerContext::new(ContextType::Question, "kinetic friction is bigger"))
                .await
                .unwrap();
            engine
                .add_academic_document(physics_doc("Friction", "S", "Static friction is bigger than kinetic friction."))
                .await
                .unwrap();
            let response = engine.query(QueryRequest::new(&profile.id, "friction")).await.unwrap();
            let gap_id = response.gaps_detected[0].id.clone();

            let first = engine.resolve_gap(&gap_id, "worked example").unwrap();
            assert!(first.is_resolved);
            let second = engine.resolve_gap(&gap_id, "worked example").unwrap();
            assert_eq!(first.resolved_at, second.resolved_at);
            assert!(engine.unresolved_gaps(&profile.id).unwrap().is_empty());

            assert!(matches!(
                engine.resolve_gap("missing", "x"),
                Err(FusionError::GapNotFound(_))
            ));
        }
    }

    mod helper_tests {
        use super::*;

        #[tokio::test]
        async fn explain_concept_scopes_query() {
            let generator = Arc::new(ScriptedGenerator::new(r#"{"gaps": []}"#, "Friction opposes motion."));
            let engine = setup_engine(generator.clone());
            let profile = engine.mastery().create_profile("lee").unwrap();
            let concept = engine
                .mastery()
                .create_concept(NewConcept {
                    name: "Friction".into(),
                    subject: "physics".into(),
                    topic: "mechanics".into(),
                    difficulty: 3,
                    ..Default::default()
                })
                .unwrap();
            engine
                .add_academic_document(physics_doc("Friction", "Physics 101", "Friction opposes relative motion."))
                .await
                .unwrap();

            let explanation = engine
                .explain_concept(ExplainRequest {
                    profile_id: profile.id.clone(),
                    concept_id: concept.id.clone(),
                    question: None,
                    session_id: None,
                    modality_override: Some(Modality::Verbal),
                })
                .await
                .unwrap();

            assert_eq!(explanation.explanation, "Friction opposes motion.");
            assert_eq!(explanation.modality_used, Modality::Verbal);
            assert_eq!(explanation.sources, vec!["Physics 101".to_string()]);
            assert_eq!(explanation.follow_up_questions.len(), 3);
            assert!(generator.seen.lock()[0].user.contains("Explain Friction in detail"));

            let history = engine.recent_learner_context(&profile.id, 1).unwrap();
            assert_eq!(history[0].concept_id.as_deref(), Some(concept.id.as_str()));
        }

        #[tokio::test]
        async fn explain_unknown_concept_is_not_found() {
            let engine = setup_engine(Arc::new(FailingGenerator));
            let err = engine
                .explain_concept(ExplainRequest {
                    profile_id: "p".into(),
                    concept_id: "missing".into(),
                    question: None,
                    session_id: None,
                    modality_override: None,
                })
                .await
                .unwrap_err();
            assert!(matches!(err, FusionError::ConceptNotFound(_)));
        }

        #[tokio::test]
        async fn semantic_search_over_sources() {
            let engine = setup_engine(Arc::new(FailingGenerator));
            let profile = engine.mastery().create_profile("max").unwrap();
            engine
                .add_learner_context(&profile.id, NewLearnerContext::new(ContextType::Question, "how does gravity work"))
                .await
                .unwrap();
            engine
                .add_academic_document(physics_doc("Gravity", "S", "Gravity attracts masses toward each other."))
                .await
                .unwrap();

            let search = |source, profile_id: Option<String>| SearchQuery {
                query: "gravity".into(),
                source,
                subject: None,
                topic: None,
                limit: 10,
                profile_id,
            };

            let academic = engine.semantic_search(search(SearchSource::Academic, None)).await.unwrap();
            assert_eq!(academic.len(), 1);
            assert_eq!(academic[0].kind, EvidenceKind::Academic);

            let all = engine
                .semantic_search(search(SearchSource::All, Some(profile.id.clone())))
                .await
                .unwrap();
            assert_eq!(all.len(), 2);
            assert!(all[0].relevance_score >= all[1].relevance_score);

            let anonymous_all = engine.semantic_search(search(SearchSource::All, None)).await.unwrap();
            assert_eq!(anonymous_all.len(), 1);

            assert!(matches!(
                engine.semantic_search(search(SearchSource::Learner, None)).await,
                Err(FusionError::Validation(_))
            ));
        }

        #[test]
        fn search_source_parsing() {
            assert_eq!(SearchSource::from_str("student"), Some(SearchSource::Learner));
            assert_eq!(SearchSource::from_str("ALL"), Some(SearchSource::All));
            assert_eq!(SearchSource::from_str("web"), None);
        }

        #[test]
        fn cited_sources_are_distinct_and_capped() {
            let item = |name: &str| {
                let mut metadata = Metadata::new();
                metadata.insert("source_name".into(), name.into());
                RetrievedEvidence {
                    id: name.into(),
                    kind: EvidenceKind::Academic,
                    content: String::new(),
                    relevance_score: 1.0,
                    metadata,
                }
            };
            let sources = distinct_sources(&[item("A"), item("A"), item("B"), item("C")]);
            assert_eq!(sources, vec!["A".to_string(), "B".to_string()]);
        }
    }
}
