use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Result, Row};
use std::path::Path;

use crate::models::{
    AcademicChunk, ChatRole, ChatTurn, Concept, ContextType, GapFinding, GapSeverity,
    LearnerEvidence, LearnerProfile, LearningSession, MasteryLevel, MasteryRecord, Misconception,
    MisconceptionSeverity, ModalityPreferences, SessionType, SourceType,
};

/// SQLite-backed store for every persisted record. Identifiers are generated
/// by the callers; the store never invents keys.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn init(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS profiles (
                id TEXT PRIMARY KEY,
                learner_id TEXT NOT NULL UNIQUE,
                overall_mastery_score REAL NOT NULL DEFAULT 0,
                learning_velocity REAL NOT NULL DEFAULT 1,
                retention_rate REAL NOT NULL DEFAULT 0.8,
                pref_visual REAL NOT NULL DEFAULT 0.5,
                pref_verbal REAL NOT NULL DEFAULT 0.5,
                pref_abstract REAL NOT NULL DEFAULT 0.5,
                pref_analogy REAL NOT NULL DEFAULT 0.5,
                pref_interactive REAL NOT NULL DEFAULT 0.5,
                total_study_time_minutes INTEGER NOT NULL DEFAULT 0,
                total_concepts_attempted INTEGER NOT NULL DEFAULT 0,
                total_concepts_mastered INTEGER NOT NULL DEFAULT 0,
                current_streak_days INTEGER NOT NULL DEFAULT 0,
                longest_streak_days INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_activity_at TEXT
            );

            CREATE TABLE IF NOT EXISTS concepts (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                subject TEXT NOT NULL,
                topic TEXT NOT NULL,
                subtopic TEXT,
                difficulty INTEGER NOT NULL DEFAULT 1 CHECK(difficulty BETWEEN 1 AND 10),
                estimated_time_minutes INTEGER NOT NULL DEFAULT 30,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS concept_prerequisites (
                concept_id TEXT NOT NULL,
                prerequisite_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                PRIMARY KEY (concept_id, prerequisite_id),
                FOREIGN KEY (concept_id) REFERENCES concepts(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS tags (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS concept_tags (
                concept_id TEXT NOT NULL,
                tag_id INTEGER NOT NULL,
                PRIMARY KEY (concept_id, tag_id),
                FOREIGN KEY (concept_id) REFERENCES concepts(id) ON DELETE CASCADE,
                FOREIGN KEY (tag_id) REFERENCES tags(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS mastery_records (
                id TEXT PRIMARY KEY,
                profile_id TEXT NOT NULL,
                concept_id TEXT NOT NULL,
                mastery_level TEXT NOT NULL DEFAULT 'not_started',
                mastery_score REAL NOT NULL DEFAULT 0,
                confidence_score REAL NOT NULL DEFAULT 0,
                attempts_count INTEGER NOT NULL DEFAULT 0,
                correct_count INTEGER NOT NULL DEFAULT 0,
                next_review_at TEXT NOT NULL,
                review_interval_days INTEGER NOT NULL DEFAULT 1,
                ease_factor REAL NOT NULL DEFAULT 2.5,
                first_seen_at TEXT NOT NULL,
                last_practiced_at TEXT,
                mastered_at TEXT,
                UNIQUE (profile_id, concept_id),
                FOREIGN KEY (profile_id) REFERENCES profiles(id) ON DELETE CASCADE,
                FOREIGN KEY (concept_id) REFERENCES concepts(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS misconceptions (
                id TEXT PRIMARY KEY,
                profile_id TEXT NOT NULL,
                concept_id TEXT,
                misconception_type TEXT NOT NULL,
                description TEXT NOT NULL,
                learner_belief TEXT NOT NULL,
                correct_understanding TEXT NOT NULL,
                severity TEXT NOT NULL DEFAULT 'medium' CHECK(severity IN ('low', 'medium', 'high', 'critical')),
                detection_source TEXT NOT NULL,
                learner_evidence_ids TEXT NOT NULL DEFAULT '[]',
                academic_evidence_ids TEXT NOT NULL DEFAULT '[]',
                is_resolved INTEGER NOT NULL DEFAULT 0,
                resolution_notes TEXT,
                detected_at TEXT NOT NULL,
                resolved_at TEXT,
                FOREIGN KEY (profile_id) REFERENCES profiles(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS learning_sessions (
                id TEXT PRIMARY KEY,
                profile_id TEXT NOT NULL,
                session_type TEXT NOT NULL CHECK(session_type IN ('lesson', 'practice', 'assessment', 'chat')),
                concepts_covered TEXT NOT NULL DEFAULT '[]',
                duration_minutes INTEGER NOT NULL DEFAULT 0,
                questions_attempted INTEGER NOT NULL DEFAULT 0,
                questions_correct INTEGER NOT NULL DEFAULT 0,
                focus_score REAL,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                FOREIGN KEY (profile_id) REFERENCES profiles(id) ON DELETE CASCADE
            );

            -- Learner-history evidence; profile_id is not a foreign key so
            -- anonymous interactions can still be recorded
            CREATE TABLE IF NOT EXISTS learner_evidence (
                id TEXT PRIMARY KEY,
                profile_id TEXT NOT NULL,
                context_type TEXT NOT NULL,
                content TEXT NOT NULL,
                concept_id TEXT,
                concept_name TEXT,
                subject TEXT,
                topic TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                was_correct INTEGER,
                confidence_score REAL,
                index_ref TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS academic_chunks (
                id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                title TEXT NOT NULL,
                source_type TEXT NOT NULL,
                source_name TEXT NOT NULL,
                content TEXT NOT NULL,
                chunk_index INTEGER NOT NULL DEFAULT 0,
                total_chunks INTEGER NOT NULL DEFAULT 1,
                subject TEXT NOT NULL,
                topic TEXT NOT NULL,
                subtopic TEXT,
                grade_level TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                difficulty INTEGER NOT NULL DEFAULT 5,
                is_verified INTEGER NOT NULL DEFAULT 1,
                quality_score REAL NOT NULL DEFAULT 1,
                index_ref TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS gap_findings (
                id TEXT PRIMARY KEY,
                profile_id TEXT NOT NULL,
                concept_id TEXT,
                concept_name TEXT NOT NULL,
                learner_belief TEXT NOT NULL,
                correct_understanding TEXT NOT NULL,
                description TEXT NOT NULL,
                severity TEXT NOT NULL CHECK(severity IN ('minor', 'moderate', 'significant', 'critical')),
                priority_score REAL NOT NULL DEFAULT 0.5,
                is_resolved INTEGER NOT NULL DEFAULT 0,
                resolution_strategy TEXT,
                learner_evidence_ids TEXT NOT NULL DEFAULT '[]',
                academic_evidence_ids TEXT NOT NULL DEFAULT '[]',
                detected_at TEXT NOT NULL,
                resolved_at TEXT
            );

            CREATE TABLE IF NOT EXISTS chat_turns (
                id TEXT PRIMARY KEY,
                profile_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL CHECK(role IN ('user', 'assistant')),
                content TEXT NOT NULL,
                concept_id TEXT,
                learner_evidence_ids TEXT NOT NULL DEFAULT '[]',
                academic_evidence_ids TEXT NOT NULL DEFAULT '[]',
                was_helpful INTEGER,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_mastery_profile ON mastery_records(profile_id);
            CREATE INDEX IF NOT EXISTS idx_mastery_next_review ON mastery_records(next_review_at);
            CREATE INDEX IF NOT EXISTS idx_concepts_subject ON concepts(subject);
            CREATE INDEX IF NOT EXISTS idx_concept_tags_concept ON concept_tags(concept_id);
            CREATE INDEX IF NOT EXISTS idx_misconceptions_profile ON misconceptions(profile_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_profile ON learning_sessions(profile_id);
            CREATE INDEX IF NOT EXISTS idx_learner_evidence_profile ON learner_evidence(profile_id);
            CREATE INDEX IF NOT EXISTS idx_academic_document ON academic_chunks(document_id);
            CREATE INDEX IF NOT EXISTS idx_academic_subject_topic ON academic_chunks(subject, topic);
            CREATE INDEX IF NOT EXISTS idx_gaps_profile ON gap_findings(profile_id);
            CREATE INDEX IF NOT EXISTS idx_chat_profile_session ON chat_turns(profile_id, session_id);
            "#,
        )?;

        // Run migrations for existing databases
        Self::migrate(&conn)?;

        conn.execute_batch(
            "CREATE INDEX IF NOT EXISTS idx_gaps_misconception ON gap_findings(misconception_id);",
        )?;

        Ok(())
    }

    // Older databases predate the gap -> misconception link
    fn migrate(conn: &Connection) -> Result<()> {
        let has_misconception_link = conn
            .prepare("SELECT misconception_id FROM gap_findings LIMIT 1")
            .is_ok();

        if !has_misconception_link {
            conn.execute_batch("ALTER TABLE gap_findings ADD COLUMN misconception_id TEXT;")?;
        }

        Ok(())
    }

    // Profile operations
    pub fn insert_profile(&self, profile: &LearnerProfile) -> Result<()> {
        let conn = self.conn.lock();
        let prefs = &profile.modality_preferences;
        conn.execute(
            r#"
            INSERT INTO profiles (
                id, learner_id, overall_mastery_score, learning_velocity, retention_rate,
                pref_visual, pref_verbal, pref_abstract, pref_analogy, pref_interactive,
                total_study_time_minutes, total_concepts_attempted, total_concepts_mastered,
                current_streak_days, longest_streak_days, created_at, updated_at, last_activity_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
            "#,
            params![
                profile.id,
                profile.learner_id,
                profile.overall_mastery_score,
                profile.learning_velocity,
                profile.retention_rate,
                prefs.visual,
                prefs.verbal,
                prefs.r#abstract,
                prefs.analogy,
                prefs.interactive,
                profile.total_study_time_minutes,
                profile.total_concepts_attempted,
                profile.total_concepts_mastered,
                profile.current_streak_days,
                profile.longest_streak_days,
                profile.created_at,
                profile.updated_at,
                profile.last_activity_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_profile(&self, id: &str) -> Result<Option<LearnerProfile>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM profiles WHERE id = ?1", PROFILE_COLUMNS),
            params![id],
            profile_from_row,
        )
        .optional()
    }

    pub fn get_profile_by_learner(&self, learner_id: &str) -> Result<Option<LearnerProfile>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM profiles WHERE learner_id = ?1", PROFILE_COLUMNS),
            params![learner_id],
            profile_from_row,
        )
        .optional()
    }

    /// Writes every mutable profile column. Concurrent writers are last-write-wins.
    pub fn update_profile(&self, profile: &LearnerProfile) -> Result<bool> {
        let conn = self.conn.lock();
        let prefs = &profile.modality_preferences;
        let rows = conn.execute(
            r#"
            UPDATE profiles
            SET overall_mastery_score = ?1,
                learning_velocity = ?2,
                retention_rate = ?3,
                pref_visual = ?4,
                pref_verbal = ?5,
                pref_abstract = ?6,
                pref_analogy = ?7,
                pref_interactive = ?8,
                total_study_time_minutes = ?9,
                total_concepts_attempted = ?10,
                total_concepts_mastered = ?11,
                current_streak_days = ?12,
                longest_streak_days = ?13,
                updated_at = ?14,
                last_activity_at = ?15
            WHERE id = ?16
            "#,
            params![
                profile.overall_mastery_score,
                profile.learning_velocity,
                profile.retention_rate,
                prefs.visual,
                prefs.verbal,
                prefs.r#abstract,
                prefs.analogy,
                prefs.interactive,
                profile.total_study_time_minutes,
                profile.total_concepts_attempted,
                profile.total_concepts_mastered,
                profile.current_streak_days,
                profile.longest_streak_days,
                profile.updated_at,
                profile.last_activity_at,
                profile.id,
            ],
        )?;
        Ok(rows > 0)
    }

    // Concept operations
    pub fn insert_concept(&self, concept: &Concept) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO concepts (id, name, description, subject, topic, subtopic, difficulty,
                                  estimated_time_minutes, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                concept.id,
                concept.name,
                concept.description,
                concept.subject,
                concept.topic,
                concept.subtopic,
                concept.difficulty,
                concept.estimated_time_minutes,
                concept.created_at,
            ],
        )?;
        Self::write_prerequisites(&tx, &concept.id, &concept.prerequisite_ids)?;
        for tag in &concept.tags {
            let tag_id = Self::get_or_create_tag(&tx, tag)?;
            tx.execute(
                "INSERT OR IGNORE INTO concept_tags (concept_id, tag_id) VALUES (?1, ?2)",
                params![concept.id, tag_id],
            )?;
        }
        tx.commit()
    }

    pub fn get_concept(&self, id: &str) -> Result<Option<Concept>> {
        let conn = self.conn.lock();
        let concept = conn
            .query_row(
                &format!("SELECT {} FROM concepts WHERE id = ?1", CONCEPT_COLUMNS),
                params![id],
                concept_from_row,
            )
            .optional()?;

        match concept {
            Some(mut c) => {
                Self::fill_concept_links(&conn, &mut c)?;
                Ok(Some(c))
            }
            None => Ok(None),
        }
    }

    pub fn find_concept_by_name(&self, name: &str) -> Result<Option<Concept>> {
        let id: Option<String> = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT id FROM concepts WHERE lower(name) = lower(?1) ORDER BY created_at LIMIT 1",
                params![name.trim()],
                |row| row.get(0),
            )
            .optional()?
        };

        match id {
            Some(id) => self.get_concept(&id),
            None => Ok(None),
        }
    }

    pub fn list_concepts(&self, subject: Option<&str>) -> Result<Vec<Concept>> {
        let conn = self.conn.lock();
        let (query, params_vec): (String, Vec<Box<dyn rusqlite::ToSql>>) = if let Some(s) = subject {
            (
                format!(
                    "SELECT {} FROM concepts WHERE subject = ?1 ORDER BY name",
                    CONCEPT_COLUMNS
                ),
                vec![Box::new(s.to_string())],
            )
        } else {
            (
                format!("SELECT {} FROM concepts ORDER BY name", CONCEPT_COLUMNS),
                vec![],
            )
        };

        let mut stmt = conn.prepare(&query)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|b| b.as_ref()).collect();
        let rows = stmt.query_map(params_refs.as_slice(), concept_from_row)?;
        let mut concepts = rows.collect::<Result<Vec<_>>>()?;

        for concept in &mut concepts {
            Self::fill_concept_links(&conn, concept)?;
        }

        Ok(concepts)
    }

    pub fn set_concept_prerequisites(&self, concept_id: &str, prerequisite_ids: &[String]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM concept_prerequisites WHERE concept_id = ?1",
            params![concept_id],
        )?;
        Self::write_prerequisites(&tx, concept_id, prerequisite_ids)?;
        tx.commit()
    }

    fn write_prerequisites(conn: &Connection, concept_id: &str, prerequisite_ids: &[String]) -> Result<()> {
        for (position, prereq) in prerequisite_ids.iter().enumerate() {
            conn.execute(
                r#"
                INSERT OR IGNORE INTO concept_prerequisites (concept_id, prerequisite_id, position)
                VALUES (?1, ?2, ?3)
                "#,
                params![concept_id, prereq, position as i64],
            )?;
        }
        Ok(())
    }

    fn fill_concept_links(conn: &Connection, concept: &mut Concept) -> Result<()> {
        let mut stmt = conn.prepare(
            "SELECT prerequisite_id FROM concept_prerequisites WHERE concept_id = ?1 ORDER BY position",
        )?;
        concept.prerequisite_ids = stmt
            .query_map(params![concept.id], |row| row.get(0))?
            .collect::<Result<Vec<String>>>()?;

        let mut stmt = conn.prepare(
            r#"
            SELECT tg.name
            FROM tags tg
            JOIN concept_tags ct ON tg.id = ct.tag_id
            WHERE ct.concept_id = ?1
            ORDER BY tg.name
            "#,
        )?;
        concept.tags = stmt
            .query_map(params![concept.id], |row| row.get(0))?
            .collect::<Result<Vec<String>>>()?;

        Ok(())
    }

    // Tag operations
    fn get_or_create_tag(conn: &Connection, name: &str) -> Result<i64> {
        let existing: Option<i64> = conn
            .query_row("SELECT id FROM tags WHERE name = ?1", params![name], |row| {
                row.get(0)
            })
            .optional()?;

        match existing {
            Some(id) => Ok(id),
            None => {
                conn.execute("INSERT INTO tags (name) VALUES (?1)", params![name])?;
                Ok(conn.last_insert_rowid())
            }
        }
    }

    // Mastery record operations
    pub fn insert_mastery(&self, record: &MasteryRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO mastery_records (
                id, profile_id, concept_id, mastery_level, mastery_score, confidence_score,
                attempts_count, correct_count, next_review_at, review_interval_days, ease_factor,
                first_seen_at, last_practiced_at, mastered_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
            params![
                record.id,
                record.profile_id,
                record.concept_id,
                record.mastery_level.as_str(),
                record.mastery_score,
                record.confidence_score,
                record.attempts_count,
                record.correct_count,
                record.next_review_at,
                record.review_interval_days,
                record.ease_factor,
                record.first_seen_at,
                record.last_practiced_at,
                record.mastered_at,
            ],
        )?;
        Ok(())
    }

    pub fn update_mastery(&self, record: &MasteryRecord) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            r#"
            UPDATE mastery_records
            SET mastery_level = ?1,
                mastery_score = ?2,
                confidence_score = ?3,
                attempts_count = ?4,
                correct_count = ?5,
                next_review_at = ?6,
                review_interval_days = ?7,
                ease_factor = ?8,
                last_practiced_at = ?9,
                mastered_at = ?10
            WHERE id = ?11
            "#,
            params![
                record.mastery_level.as_str(),
                record.mastery_score,
                record.confidence_score,
                record.attempts_count,
                record.correct_count,
                record.next_review_at,
                record.review_interval_days,
                record.ease_factor,
                record.last_practiced_at,
                record.mastered_at,
                record.id,
            ],
        )?;
        Ok(rows > 0)
    }

    pub fn get_mastery(&self, profile_id: &str, concept_id: &str) -> Result<Option<MasteryRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {} FROM mastery_records WHERE profile_id = ?1 AND concept_id = ?2",
                MASTERY_COLUMNS
            ),
            params![profile_id, concept_id],
            mastery_from_row,
        )
        .optional()
    }

    pub fn list_masteries(&self, profile_id: &str) -> Result<Vec<MasteryRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM mastery_records WHERE profile_id = ?1 ORDER BY first_seen_at",
            MASTERY_COLUMNS
        ))?;
        let rows = stmt.query_map(params![profile_id], mastery_from_row)?;
        rows.collect()
    }

    /// Records whose review time has passed, soonest-due first.
    pub fn due_masteries(
        &self,
        profile_id: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MasteryRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {}
            FROM mastery_records
            WHERE profile_id = ?1 AND next_review_at <= ?2
            ORDER BY next_review_at ASC
            LIMIT ?3
            "#,
            MASTERY_COLUMNS
        ))?;
        let rows = stmt.query_map(params![profile_id, now, limit as i64], mastery_from_row)?;
        rows.collect()
    }

    // Misconception operations
    pub fn insert_misconception(&self, m: &Misconception) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO misconceptions (
                id, profile_id, concept_id, misconception_type, description, learner_belief,
                correct_understanding, severity, detection_source, learner_evidence_ids,
                academic_evidence_ids, is_resolved, resolution_notes, detected_at, resolved_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
            params![
                m.id,
                m.profile_id,
                m.concept_id,
                m.misconception_type,
                m.description,
                m.learner_belief,
                m.correct_understanding,
                m.severity.as_str(),
                m.detection_source,
                ids_to_json(&m.learner_evidence_ids),
                ids_to_json(&m.academic_evidence_ids),
                m.is_resolved,
                m.resolution_notes,
                m.detected_at,
                m.resolved_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_misconception(&self, id: &str) -> Result<Option<Misconception>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM misconceptions WHERE id = ?1", MISCONCEPTION_COLUMNS),
            params![id],
            misconception_from_row,
        )
        .optional()
    }

    pub fn resolve_misconception(
        &self,
        id: &str,
        notes: Option<&str>,
        resolved_at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            r#"
            UPDATE misconceptions
            SET is_resolved = 1,
                resolution_notes = COALESCE(?1, resolution_notes),
                resolved_at = COALESCE(resolved_at, ?2)
            WHERE id = ?3
            "#,
            params![notes, resolved_at, id],
        )?;
        Ok(rows > 0)
    }

    pub fn active_misconceptions(&self, profile_id: &str) -> Result<Vec<Misconception>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {}
            FROM misconceptions
            WHERE profile_id = ?1 AND is_resolved = 0
            ORDER BY detected_at DESC, rowid DESC
            "#,
            MISCONCEPTION_COLUMNS
        ))?;
        let rows = stmt.query_map(params![profile_id], misconception_from_row)?;
        rows.collect()
    }

    // Learning session operations
    pub fn insert_session(&self, session: &LearningSession) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO learning_sessions (
                id, profile_id, session_type, concepts_covered, duration_minutes,
                questions_attempted, questions_correct, focus_score, started_at, ended_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                session.id,
                session.profile_id,
                session.session_type.as_str(),
                ids_to_json(&session.concepts_covered),
                session.duration_minutes,
                session.questions_attempted,
                session.questions_correct,
                session.focus_score,
                session.started_at,
                session.ended_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_session(&self, id: &str) -> Result<Option<LearningSession>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM learning_sessions WHERE id = ?1", SESSION_COLUMNS),
            params![id],
            session_from_row,
        )
        .optional()
    }

    pub fn update_session(&self, session: &LearningSession) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            r#"
            UPDATE learning_sessions
            SET duration_minutes = ?1,
                questions_attempted = ?2,
                questions_correct = ?3,
                focus_score = ?4,
                ended_at = ?5
            WHERE id = ?6
            "#,
            params![
                session.duration_minutes,
                session.questions_attempted,
                session.questions_correct,
                session.focus_score,
                session.ended_at,
                session.id,
            ],
        )?;
        Ok(rows > 0)
    }

    pub fn list_sessions(&self, profile_id: &str) -> Result<Vec<LearningSession>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM learning_sessions WHERE profile_id = ?1 ORDER BY started_at DESC",
            SESSION_COLUMNS
        ))?;
        let rows = stmt.query_map(params![profile_id], session_from_row)?;
        rows.collect()
    }

    // Learner evidence operations
    pub fn insert_learner_evidence(&self, e: &LearnerEvidence) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO learner_evidence (
                id, profile_id, context_type, content, concept_id, concept_name, subject, topic,
                tags, was_correct, confidence_score, index_ref, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                e.id,
                e.profile_id,
                e.context_type.as_str(),
                e.content,
                e.concept_id,
                e.concept_name,
                e.subject,
                e.topic,
                ids_to_json(&e.tags),
                e.was_correct,
                e.confidence_score,
                e.index_ref,
                e.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn set_learner_evidence_ref(&self, id: &str, index_ref: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE learner_evidence SET index_ref = ?1 WHERE id = ?2",
            params![index_ref, id],
        )?;
        Ok(rows > 0)
    }

    pub fn get_learner_evidence(&self, id: &str) -> Result<Option<LearnerEvidence>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM learner_evidence WHERE id = ?1", LEARNER_EVIDENCE_COLUMNS),
            params![id],
            learner_evidence_from_row,
        )
        .optional()
    }

    pub fn recent_learner_evidence(&self, profile_id: &str, limit: usize) -> Result<Vec<LearnerEvidence>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {}
            FROM learner_evidence
            WHERE profile_id = ?1
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?2
            "#,
            LEARNER_EVIDENCE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![profile_id, limit as i64], learner_evidence_from_row)?;
        rows.collect()
    }

    // Academic chunk operations
    pub fn insert_academic_chunk(&self, c: &AcademicChunk) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO academic_chunks (
                id, document_id, title, source_type, source_name, content, chunk_index,
                total_chunks, subject, topic, subtopic, grade_level, tags, difficulty,
                is_verified, quality_score, index_ref, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
            "#,
            params![
                c.id,
                c.document_id,
                c.title,
                c.source_type.as_str(),
                c.source_name,
                c.content,
                c.chunk_index,
                c.total_chunks,
                c.subject,
                c.topic,
                c.subtopic,
                c.grade_level,
                ids_to_json(&c.tags),
                c.difficulty,
                c.is_verified,
                c.quality_score,
                c.index_ref,
                c.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn set_academic_chunk_ref(&self, id: &str, index_ref: Option<&str>) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE academic_chunks SET index_ref = ?1 WHERE id = ?2",
            params![index_ref, id],
        )?;
        Ok(rows > 0)
    }

    /// Records the index reference and marks the chunk retrievable.
    pub fn mark_chunk_indexed(&self, id: &str, index_ref: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE academic_chunks SET index_ref = ?1, is_verified = 1 WHERE id = ?2",
            params![index_ref, id],
        )?;
        Ok(rows > 0)
    }

    pub fn chunks_for_document(&self, document_id: &str) -> Result<Vec<AcademicChunk>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM academic_chunks WHERE document_id = ?1 ORDER BY chunk_index",
            ACADEMIC_COLUMNS
        ))?;
        let rows = stmt.query_map(params![document_id], academic_from_row)?;
        rows.collect()
    }

    pub fn mark_document_unverified(&self, document_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE academic_chunks SET is_verified = 0 WHERE document_id = ?1",
            params![document_id],
        )
    }

    pub fn list_academic_chunks(
        &self,
        subject: Option<&str>,
        topic: Option<&str>,
        limit: usize,
    ) -> Result<Vec<AcademicChunk>> {
        let conn = self.conn.lock();
        let mut clauses: Vec<&str> = Vec::new();
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(s) = subject {
            params_vec.push(Box::new(s.to_string()));
            clauses.push("subject = ?");
        }
        if let Some(t) = topic {
            params_vec.push(Box::new(t.to_string()));
            clauses.push("topic = ?");
        }
        params_vec.push(Box::new(limit as i64));

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let query = format!(
            "SELECT {} FROM academic_chunks {} ORDER BY created_at DESC, chunk_index ASC LIMIT ?",
            ACADEMIC_COLUMNS, where_clause
        );

        let mut stmt = conn.prepare(&query)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|b| b.as_ref()).collect();
        let rows = stmt.query_map(params_refs.as_slice(), academic_from_row)?;
        rows.collect()
    }

    // Gap finding operations
    pub fn insert_gap(&self, g: &GapFinding) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO gap_findings (
                id, profile_id, concept_id, concept_name, learner_belief, correct_understanding,
                description, severity, priority_score, is_resolved, resolution_strategy,
                learner_evidence_ids, academic_evidence_ids, misconception_id, detected_at, resolved_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            "#,
            params![
                g.id,
                g.profile_id,
                g.concept_id,
                g.concept_name,
                g.learner_belief,
                g.correct_understanding,
                g.description,
                g.severity.as_str(),
                g.priority_score,
                g.is_resolved,
                g.resolution_strategy,
                ids_to_json(&g.learner_evidence_ids),
                ids_to_json(&g.academic_evidence_ids),
                g.misconception_id,
                g.detected_at,
                g.resolved_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_gap(&self, id: &str) -> Result<Option<GapFinding>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM gap_findings WHERE id = ?1", GAP_COLUMNS),
            params![id],
            gap_from_row,
        )
        .optional()
    }

    pub fn resolve_gap(&self, id: &str, strategy: &str, resolved_at: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            r#"
            UPDATE gap_findings
            SET is_resolved = 1,
                resolution_strategy = ?1,
                resolved_at = COALESCE(resolved_at, ?2)
            WHERE id = ?3
            "#,
            params![strategy, resolved_at, id],
        )?;
        Ok(rows > 0)
    }

    pub fn unresolved_gaps(&self, profile_id: &str) -> Result<Vec<GapFinding>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {}
            FROM gap_findings
            WHERE profile_id = ?1 AND is_resolved = 0
            ORDER BY priority_score DESC, detected_at DESC
            "#,
            GAP_COLUMNS
        ))?;
        let rows = stmt.query_map(params![profile_id], gap_from_row)?;
        rows.collect()
    }

    // Chat log operations
    pub fn insert_chat_turn(&self, t: &ChatTurn) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO chat_turns (
                id, profile_id, session_id, role, content, concept_id,
                learner_evidence_ids, academic_evidence_ids, was_helpful, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                t.id,
                t.profile_id,
                t.session_id,
                t.role.as_str(),
                t.content,
                t.concept_id,
                ids_to_json(&t.learner_evidence_ids),
                ids_to_json(&t.academic_evidence_ids),
                t.was_helpful,
                t.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn chat_history(
        &self,
        profile_id: &str,
        session_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ChatTurn>> {
        let conn = self.conn.lock();
        let (query, params_vec): (String, Vec<Box<dyn rusqlite::ToSql>>) = if let Some(sid) = session_id {
            (
                format!(
                    r#"
                    SELECT {}
                    FROM chat_turns
                    WHERE profile_id = ?1 AND session_id = ?2
                    ORDER BY created_at DESC, rowid DESC
                    LIMIT ?3
                    "#,
                    CHAT_COLUMNS
                ),
                vec![
                    Box::new(profile_id.to_string()),
                    Box::new(sid.to_string()),
                    Box::new(limit as i64),
                ],
            )
        } else {
            (
                format!(
                    r#"
                    SELECT {}
                    FROM chat_turns
                    WHERE profile_id = ?1
                    ORDER BY created_at DESC, rowid DESC
                    LIMIT ?2
                    "#,
                    CHAT_COLUMNS
                ),
                vec![Box::new(profile_id.to_string()), Box::new(limit as i64)],
            )
        };

        let mut stmt = conn.prepare(&query)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|b| b.as_ref()).collect();
        let rows = stmt.query_map(params_refs.as_slice(), chat_from_row)?;
        rows.collect()
    }

    pub fn set_chat_feedback(&self, id: &str, was_helpful: bool) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE chat_turns SET was_helpful = ?1 WHERE id = ?2",
            params![was_helpful, id],
        )?;
        Ok(rows > 0)
    }

    pub fn get_stats(&self, now: DateTime<Utc>) -> Result<Stats> {
        let conn = self.conn.lock();
        let count = |sql: &str| -> Result<i64> { conn.query_row(sql, [], |row| row.get(0)) };

        let due_now: i64 = conn.query_row(
            "SELECT COUNT(*) FROM mastery_records WHERE next_review_at <= ?1",
            params![now],
            |row| row.get(0),
        )?;

        let avg_mastery: f64 = conn
            .query_row(
                "SELECT COALESCE(AVG(mastery_score), 0) FROM mastery_records",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0.0);

        Ok(Stats {
            profiles: count("SELECT COUNT(*) FROM profiles")?,
            concepts: count("SELECT COUNT(*) FROM concepts")?,
            mastery_records: count("SELECT COUNT(*) FROM mastery_records")?,
            mastered: count(
                "SELECT COUNT(*) FROM mastery_records WHERE mastery_level IN ('mastered', 'expert')",
            )?,
            due_now,
            avg_mastery,
            active_misconceptions: count("SELECT COUNT(*) FROM misconceptions WHERE is_resolved = 0")?,
            learner_evidence: count("SELECT COUNT(*) FROM learner_evidence")?,
            academic_chunks: count("SELECT COUNT(*) FROM academic_chunks")?,
            chat_turns: count("SELECT COUNT(*) FROM chat_turns")?,
        })
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Stats {
    pub profiles: i64,
    pub concepts: i64,
    pub mastery_records: i64,
    pub mastered: i64,
    pub due_now: i64,
    pub avg_mastery: f64,
    pub active_misconceptions: i64,
    pub learner_evidence: i64,
    pub academic_chunks: i64,
    pub chat_turns: i64,
}

const PROFILE_COLUMNS: &str = "id, learner_id, overall_mastery_score, learning_velocity, retention_rate, \
     pref_visual, pref_verbal, pref_abstract, pref_analogy, pref_interactive, \
     total_study_time_minutes, total_concepts_attempted, total_concepts_mastered, \
     current_streak_days, longest_streak_days, created_at, updated_at, last_activity_at";

const CONCEPT_COLUMNS: &str =
    "id, name, description, subject, topic, subtopic, difficulty, estimated_time_minutes, created_at";

const MASTERY_COLUMNS: &str = "id, profile_id, concept_id, mastery_level, mastery_score, confidence_score, \
     attempts_count, correct_count, next_review_at, review_interval_days, ease_factor, \
     first_seen_at, last_practiced_at, mastered_at";

const MISCONCEPTION_COLUMNS: &str = "id, profile_id, concept_id, misconception_type, description, \
     learner_belief, correct_understanding, severity, detection_source, learner_evidence_ids, \
     academic_evidence_ids, is_resolved, resolution_notes, detected_at, resolved_at";

const SESSION_COLUMNS: &str = "id, profile_id, session_type, concepts_covered, duration_minutes, \
     questions_attempted, questions_correct, focus_score, started_at, ended_at";

const LEARNER_EVIDENCE_COLUMNS: &str = "id, profile_id, context_type, content, concept_id, concept_name, \
     subject, topic, tags, was_correct, confidence_score, index_ref, created_at";

const ACADEMIC_COLUMNS: &str = "id, document_id, title, source_type, source_name, content, chunk_index, \
     total_chunks, subject, topic, subtopic, grade_level, tags, difficulty, is_verified, \
     quality_score, index_ref, created_at";

const GAP_COLUMNS: &str = "id, profile_id, concept_id, concept_name, learner_belief, correct_understanding, \
     description, severity, priority_score, is_resolved, resolution_strategy, learner_evidence_ids, \
     academic_evidence_ids, misconception_id, detected_at, resolved_at";

const CHAT_COLUMNS: &str = "id, profile_id, session_id, role, content, concept_id, learner_evidence_ids, \
     academic_evidence_ids, was_helpful, created_at";

fn ids_to_json(ids: &[String]) -> String {
    serde_json::to_string(ids).unwrap_or_else(|_| "[]".to_string())
}

fn ids_from_json(raw: String) -> Vec<String> {
    serde_json::from_str(&raw).unwrap_or_default()
}

fn profile_from_row(row: &Row) -> Result<LearnerProfile> {
    Ok(LearnerProfile {
        id: row.get(0)?,
        learner_id: row.get(1)?,
        overall_mastery_score: row.get(2)?,
        learning_velocity: row.get(3)?,
        retention_rate: row.get(4)?,
        modality_preferences: ModalityPreferences {
            visual: row.get(5)?,
            verbal: row.get(6)?,
            r#abstract: row.get(7)?,
            analogy: row.get(8)?,
            interactive: row.get(9)?,
        },
        total_study_time_minutes: row.get(10)?,
        total_concepts_attempted: row.get(11)?,
        total_concepts_mastered: row.get(12)?,
        current_streak_days: row.get(13)?,
        longest_streak_days: row.get(14)?,
        created_at: row.get(15)?,
        updated_at: row.get(16)?,
        last_activity_at: row.get(17)?,
    })
}

fn concept_from_row(row: &Row) -> Result<Concept> {
    Ok(Concept {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        subject: row.get(3)?,
        topic: row.get(4)?,
        subtopic: row.get(5)?,
        difficulty: row.get(6)?,
        estimated_time_minutes: row.get(7)?,
        created_at: row.get(8)?,
        prerequisite_ids: vec![],
        tags: vec![],
    })
}

fn mastery_from_row(row: &Row) -> Result<MasteryRecord> {
    let level_str: String = row.get(3)?;
    Ok(MasteryRecord {
        id: row.get(0)?,
        profile_id: row.get(1)?,
        concept_id: row.get(2)?,
        mastery_level: MasteryLevel::from_str(&level_str).unwrap_or(MasteryLevel::NotStarted),
        mastery_score: row.get(4)?,
        confidence_score: row.get(5)?,
        attempts_count: row.get(6)?,
        correct_count: row.get(7)?,
        next_review_at: row.get(8)?,
        review_interval_days: row.get(9)?,
        ease_factor: row.get(10)?,
        first_seen_at: row.get(11)?,
        last_practiced_at: row.get(12)?,
        mastered_at: row.get(13)?,
    })
}

fn misconception_from_row(row: &Row) -> Result<Misconception> {
    let severity_str: String = row.get(7)?;
    Ok(Misconception {
        id: row.get(0)?,
        profile_id: row.get(1)?,
        concept_id: row.get(2)?,
        misconception_type: row.get(3)?,
        description: row.get(4)?,
        learner_belief: row.get(5)?,
        correct_understanding: row.get(6)?,
        severity: MisconceptionSeverity::from_str(&severity_str).unwrap_or_default(),
        detection_source: row.get(8)?,
        learner_evidence_ids: ids_from_json(row.get(9)?),
        academic_evidence_ids: ids_from_json(row.get(10)?),
        is_resolved: row.get(11)?,
        resolution_notes: row.get(12)?,
        detected_at: row.get(13)?,
        resolved_at: row.get(14)?,
    })
}

fn session_from_row(row: &Row) -> Result<LearningSession> {
    let type_str: String = row.get(2)?;
    Ok(LearningSession {
        id: row.get(0)?,
        profile_id: row.get(1)?,
        session_type: SessionType::from_str(&type_str).unwrap_or(SessionType::Lesson),
        concepts_covered: ids_from_json(row.get(3)?),
        duration_minutes: row.get(4)?,
        questions_attempted: row.get(5)?,
        questions_correct: row.get(6)?,
        focus_score: row.get(7)?,
        started_at: row.get(8)?,
        ended_at: row.get(9)?,
    })
}

fn learner_evidence_from_row(row: &Row) -> Result<LearnerEvidence> {
    let type_str: String = row.get(2)?;
    Ok(LearnerEvidence {
        id: row.get(0)?,
        profile_id: row.get(1)?,
        context_type: ContextType::from_str(&type_str).unwrap_or(ContextType::Chat),
        content: row.get(3)?,
        concept_id: row.get(4)?,
        concept_name: row.get(5)?,
        subject: row.get(6)?,
        topic: row.get(7)?,
        tags: ids_from_json(row.get(8)?),
        was_correct: row.get(9)?,
        confidence_score: row.get(10)?,
        index_ref: row.get(11)?,
        created_at: row.get(12)?,
    })
}

fn academic_from_row(row: &Row) -> Result<AcademicChunk> {
    let source_str: String = row.get(3)?;
    Ok(AcademicChunk {
        id: row.get(0)?,
        document_id: row.get(1)?,
        title: row.get(2)?,
        source_type: SourceType::from_str(&source_str).unwrap_or(SourceType::Textbook),
        source_name: row.get(4)?,
        content: row.get(5)?,
        chunk_index: row.get(6)?,
        total_chunks: row.get(7)?,
        subject: row.get(8)?,
        topic: row.get(9)?,
        subtopic: row.get(10)?,
        grade_level: row.get(11)?,
        tags: ids_from_json(row.get(12)?),
        difficulty: row.get(13)?,
        is_verified: row.get(14)?,
        quality_score: row.get(15)?,
        index_ref: row.get(16)?,
        created_at: row.get(17)?,
    })
}

fn gap_from_row(row: &Row) -> Result<GapFinding> {
    let severity_str: String = row.get(7)?;
    Ok(GapFinding {
        id: row.get(0)?,
        profile_id: row.get(1)?,
        concept_id: row.get(2)?,
        concept_name: row.get(3)?,
        learner_belief: row.get(4)?,
        correct_understanding: row.get(5)?,
        description: row.get(6)?,
        severity: GapSeverity::from_str(&severity_str).unwrap_or_default(),
        priority_score: row.get(8)?,
        is_resolved: row.get(9)?,
        resolution_strategy: row.get(10)?,
        learner_evidence_ids: ids_from_json(row.get(11)?),
        academic_evidence_ids: ids_from_json(row.get(12)?),
        misconception_id: row.get(13)?,
        detected_at: row.get(14)?,
        resolved_at: row.get(15)?,
    })
}

fn chat_from_row(row: &Row) -> Result<ChatTurn> {
    let role_str: String = row.get(3)?;
    Ok(ChatTurn {
        id: row.get(0)?,
        profile_id: row.get(1)?,
        session_id: row.get(2)?,
        role: ChatRole::from_str(&role_str).unwrap_or(ChatRole::User),
        content: row.get(4)?,
        concept_id: row.get(5)?,
        learner_evidence_ids: ids_from_json(row.get(6)?),
        academic_evidence_ids: ids_from_json(row.get(7)?),
        was_helpful: row.get(8)?,
        created_at: row.get(9)?,
    })
}
