mod config;
mod db;
mod error;
mod fusion;
mod generator;
mod index;
mod logging;
mod mastery;
mod models;

use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::debug;

use config::Config;
use db::Database;
use fusion::{ExplainRequest, FusionEngine, QueryRequest, SearchQuery, SearchSource};
use generator::OpenAiGenerator;
use index::{HashingEmbedder, SqliteEvidenceIndex};
use models::{
    ContextType, JsonOutput, Modality, MisconceptionSeverity, NewAcademicDocument, NewConcept, NewLearnerContext,
    NewMisconception, PracticeUpdate, SessionStats, SessionType, SourceType,
};

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "learntwin")]
#[command(about = "An adaptive learning twin: mastery tracking and dual-source answers")]
#[command(version)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Manage learner profiles
    #[command(subcommand)]
    Profile(ProfileCommands),

    /// Manage concepts
    #[command(subcommand)]
    Concept(ConceptCommands),

    /// Record a practice event for a concept
    Practice {
        /// Profile ID
        profile: String,

        /// Concept ID
        concept: String,

        /// The answer was correct
        #[arg(long, conflicts_with = "incorrect")]
        correct: bool,

        /// The answer was incorrect
        #[arg(long)]
        incorrect: bool,

        /// Set the mastery score directly (0-1)
        #[arg(long)]
        score: Option<f64>,

        /// Set the confidence directly (0-1)
        #[arg(long)]
        confidence: Option<f64>,
    },

    /// List concepts due for review
    Due {
        /// Profile ID
        profile: String,

        #[arg(long, short, default_value_t = 10)]
        limit: usize,
    },

    /// Pick the next concept to review (stochastic selection)
    Next {
        /// Profile ID
        profile: String,
    },

    /// Record learner activity for today's streak
    Activity {
        /// Profile ID
        profile: String,
    },

    /// Explanation-style preferences
    #[command(subcommand)]
    Modality(ModalityCommands),

    /// Manage misconceptions
    #[command(subcommand)]
    Misconception(MisconceptionCommands),

    /// Manage learning sessions
    #[command(subcommand)]
    Session(SessionCommands),

    /// Show learning analytics for a profile
    Analytics {
        /// Profile ID
        profile: String,
    },

    /// Show the knowledge graph for a profile
    Graph {
        /// Profile ID
        profile: String,
    },

    /// Manage verified academic documents
    #[command(subcommand)]
    Academic(AcademicCommands),

    /// Record learner-history evidence
    #[command(subcommand)]
    Context(ContextCommands),

    /// Ask a question, answered from learner history and academic sources
    Ask {
        /// Profile ID
        profile: String,

        /// The question
        query: String,

        #[arg(long, short)]
        session: Option<String>,

        #[arg(long, short)]
        concept: Option<String>,

        #[arg(long)]
        subject: Option<String>,

        #[arg(long)]
        topic: Option<String>,

        /// Override the preferred explanation style
        #[arg(long, short)]
        modality: Option<String>,

        /// Skip learner-history retrieval
        #[arg(long)]
        no_history: bool,

        /// Skip academic retrieval
        #[arg(long)]
        no_academic: bool,

        #[arg(long)]
        learner_k: Option<usize>,

        #[arg(long)]
        academic_k: Option<usize>,
    },

    /// Explain a concept
    Explain {
        /// Profile ID
        profile: String,

        /// Concept ID
        concept: String,

        #[arg(long, short)]
        question: Option<String>,

        #[arg(long, short)]
        session: Option<String>,

        #[arg(long, short)]
        modality: Option<String>,
    },

    /// Semantic search over indexed evidence
    Search {
        query: String,

        /// learner, academic or all
        #[arg(long, default_value = "academic")]
        source: String,

        #[arg(long)]
        subject: Option<String>,

        #[arg(long)]
        topic: Option<String>,

        #[arg(long, short, default_value_t = 10)]
        limit: usize,

        /// Profile ID, required for learner search
        #[arg(long, short)]
        profile: Option<String>,
    },

    /// Detected knowledge gaps
    #[command(subcommand)]
    Gaps(GapCommands),

    /// Chat log
    #[command(subcommand)]
    Chat(ChatCommands),

    /// Show overall statistics
    Stats,
}

#[derive(Subcommand)]
enum ProfileCommands {
    /// Create a profile for a learner
    Create {
        /// External learner ID
        learner_id: String,
    },

    /// Show a profile
    Show {
        /// Profile ID (or learner ID with --learner)
        id: String,

        /// Look up by learner ID
        #[arg(long)]
        learner: bool,
    },

    /// Update aggregate metrics
    Update {
        /// Profile ID
        id: String,

        #[arg(long)]
        velocity: Option<f64>,

        #[arg(long)]
        retention: Option<f64>,
    },
}

#[derive(Subcommand)]
enum ConceptCommands {
    /// Add a new concept
    Add {
        /// Concept name
        name: String,

        #[arg(long, short)]
        subject: String,

        #[arg(long)]
        topic: String,

        #[arg(long)]
        subtopic: Option<String>,

        #[arg(long, short)]
        description: Option<String>,

        /// Difficulty from 1 to 10
        #[arg(long, default_value_t = 5)]
        difficulty: i32,

        /// Comma-separated prerequisite concept IDs
        #[arg(long, short)]
        prereqs: Option<String>,

        /// Comma-separated tags
        #[arg(long, short)]
        tags: Option<String>,

        /// Estimated study time in minutes
        #[arg(long)]
        minutes: Option<i32>,
    },

    /// List concepts
    List {
        /// Filter by subject
        #[arg(long, short)]
        subject: Option<String>,
    },

    /// Show concept details
    Show {
        /// Concept ID
        id: String,
    },

    /// Replace a concept's prerequisites
    Prereqs {
        /// Concept ID
        id: String,

        /// Comma-separated prerequisite concept IDs (empty clears)
        #[arg(long)]
        set: String,
    },
}

#[derive(Subcommand)]
enum ModalityCommands {
    /// Record whether an explanation style worked
    Feedback {
        /// Profile ID
        profile: String,

        /// visual, verbal, abstract, analogy or interactive
        modality: String,

        #[arg(long, conflicts_with = "failure")]
        success: bool,

        #[arg(long)]
        failure: bool,

        #[arg(long, default_value_t = 0.1)]
        rate: f64,
    },

    /// Show preference weights
    Show {
        /// Profile ID
        profile: String,
    },
}

#[derive(Subcommand)]
enum MisconceptionCommands {
    /// Flag a misconception
    Add {
        /// Profile ID
        profile: String,

        #[arg(long, short)]
        concept: Option<String>,

        #[arg(long, short)]
        description: String,

        /// What the learner believes
        #[arg(long)]
        belief: String,

        /// The correct understanding
        #[arg(long)]
        correct: String,

        /// low, medium, high or critical
        #[arg(long, default_value = "medium")]
        severity: String,
    },

    /// List active misconceptions
    List {
        /// Profile ID
        profile: String,
    },

    /// Resolve a misconception
    Resolve {
        /// Misconception ID
        id: String,

        #[arg(long, short)]
        notes: Option<String>,
    },
}

#[derive(Subcommand)]
enum SessionCommands {
    /// Start a learning session
    Start {
        /// Profile ID
        profile: String,

        /// lesson, practice, assessment or chat
        #[arg(long = "type", short, default_value = "lesson")]
        session_type: String,

        /// Comma-separated concept IDs
        #[arg(long, short)]
        concepts: Option<String>,
    },

    /// End a learning session
    End {
        /// Session ID
        id: String,

        #[arg(long)]
        duration: Option<i64>,

        #[arg(long)]
        attempted: Option<i64>,

        #[arg(long)]
        correct: Option<i64>,

        #[arg(long)]
        focus: Option<f64>,
    },

    /// List sessions
    List {
        /// Profile ID
        profile: String,
    },
}

#[derive(Subcommand)]
enum AcademicCommands {
    /// Add a verified document
    Add {
        #[arg(long)]
        title: String,

        #[arg(long)]
        source_name: String,

        /// textbook, lecture, pdf or curriculum
        #[arg(long, default_value = "textbook")]
        source_type: String,

        #[arg(long, short)]
        subject: String,

        #[arg(long)]
        topic: String,

        #[arg(long)]
        subtopic: Option<String>,

        #[arg(long)]
        grade: Option<String>,

        #[arg(long, default_value_t = 5)]
        difficulty: i32,

        /// Comma-separated tags
        #[arg(long, short)]
        tags: Option<String>,

        /// Read content from a file
        #[arg(long, short, conflicts_with = "content")]
        file: Option<std::path::PathBuf>,

        /// Inline content
        #[arg(long, short)]
        content: Option<String>,
    },

    /// List document chunks
    List {
        #[arg(long, short)]
        subject: Option<String>,

        #[arg(long)]
        topic: Option<String>,

        #[arg(long, short, default_value_t = 20)]
        limit: usize,
    },

    /// Remove a document from retrieval
    Retract {
        /// Document ID
        document_id: String,
    },
}

#[derive(Subcommand)]
enum ContextCommands {
    /// Add learner-history evidence
    Add {
        /// Profile ID
        profile: String,

        content: String,

        /// question, explanation, chat or assessment
        #[arg(long = "type", default_value = "question")]
        context_type: String,

        #[arg(long, short)]
        concept: Option<String>,

        #[arg(long)]
        concept_name: Option<String>,

        #[arg(long)]
        subject: Option<String>,

        #[arg(long)]
        topic: Option<String>,

        #[arg(long, conflicts_with = "incorrect")]
        correct: bool,

        #[arg(long)]
        incorrect: bool,

        #[arg(long)]
        confidence: Option<f64>,
    },
}

#[derive(Subcommand)]
enum GapCommands {
    /// List unresolved gaps, highest priority first
    List {
        /// Profile ID
        profile: String,
    },

    /// Resolve a gap
    Resolve {
        /// Gap ID
        id: String,

        #[arg(long, short)]
        strategy: String,
    },
}

#[derive(Subcommand)]
enum ChatCommands {
    /// Show chat history, newest first
    History {
        /// Profile ID
        profile: String,

        #[arg(long, short)]
        session: Option<String>,

        #[arg(long, short, default_value_t = 20)]
        limit: usize,
    },

    /// Rate an assistant message
    Feedback {
        /// Message ID
        id: String,

        #[arg(long, conflicts_with = "unhelpful")]
        helpful: bool,

        #[arg(long)]
        unhelpful: bool,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let _log_guard = logging::init_tracing();

    let cli = Cli::parse();
    let json = cli.json;

    if let Err(e) = run(cli).await {
        if json {
            println!("{}", serde_json::to_string(&JsonOutput::<()>::err(e.to_string())).unwrap_or_default());
        } else {
            eprintln!("Error: {}", e);
        }
        std::process::exit(1);
    }
}

fn print_json<T: Serialize>(data: T) -> CliResult {
    println!("{}", serde_json::to_string(&JsonOutput::ok(data))?);
    Ok(())
}

fn split_list(s: Option<&str>) -> Vec<String> {
    s.map(|t| {
        t.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

fn flag_pair(yes: bool, no: bool) -> Option<bool> {
    match (yes, no) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

fn parse_modality(s: Option<&str>) -> Result<Option<Modality>, String> {
    match s {
        None => Ok(None),
        Some(m) => Modality::from_str(m)
            .map(Some)
            .ok_or_else(|| format!("Invalid modality '{}'. Use: visual, verbal, abstract, analogy, interactive", m)),
    }
}

fn or_dash(s: Option<&str>) -> &str {
    s.unwrap_or("-")
}

async fn run(cli: Cli) -> CliResult {
    let config = Config::from_env();
    let db = Arc::new(Database::open(&config.db_path)?);
    db.init()?;

    let index = SqliteEvidenceIndex::open(&config.index_db_path, Arc::new(HashingEmbedder::default()))?;
    let generator = OpenAiGenerator::from_env();
    if !generator.is_available() {
        debug!("no text generator configured, answers will use the template fallback");
    }

    let fusion = FusionEngine::new(db.clone(), Arc::new(index), Arc::new(generator), config.fusion.clone());
    let mastery = fusion.mastery().clone();

    match cli.command {
        Commands::Init => {
            if cli.json {
                print_json(serde_json::json!({
                    "db_path": config.db_path,
                    "index_db_path": config.index_db_path
                }))?;
            } else {
                println!("Database initialized at: {}", config.db_path.display());
                println!("Evidence index at: {}", config.index_db_path.display());
            }
        }

        Commands::Profile(cmd) => match cmd {
            ProfileCommands::Create { learner_id } => {
                let profile = mastery.create_profile(&learner_id)?;
                if cli.json {
                    print_json(&profile)?;
                } else {
                    println!("Created profile {} for learner '{}'.", profile.id, profile.learner_id);
                }
            }

            ProfileCommands::Show { id, learner } => {
                let profile = if learner {
                    mastery.get_profile_by_learner(&id)?
                } else {
                    mastery.get_profile(&id)?
                };
                let masteries = mastery.profile_masteries(&profile.id)?;

                if cli.json {
                    print_json(serde_json::json!({
                        "profile": profile,
                        "masteries": masteries
                    }))?;
                } else {
                    println!("Profile: {}", profile.id);
                    println!("Learner: {}", profile.learner_id);
                    println!("Overall mastery: {:.0}%", profile.overall_mastery_score * 100.0);
                    println!("Learning velocity: {:.2}", profile.learning_velocity);
                    println!("Retention rate: {:.2}", profile.retention_rate);
                    println!(
                        "Concepts: {} attempted, {} mastered",
                        profile.total_concepts_attempted, profile.total_concepts_mastered
                    );
                    println!(
                        "Streak: {} days (longest {})",
                        profile.current_streak_days, profile.longest_streak_days
                    );
                    println!("Study time: {} min", profile.total_study_time_minutes);
                    println!("Preferred style: {}", profile.modality_preferences.preferred().as_str());
                    if let Some(last) = &profile.last_activity_at {
                        println!("Last active: {}", last);
                    }
                }
            }

            ProfileCommands::Update { id, velocity, retention } => {
                let profile = mastery.update_profile(&id, velocity, retention)?;
                if cli.json {
                    print_json(&profile)?;
                } else {
                    println!(
                        "Updated profile {}: velocity {:.2}, retention {:.2}.",
                        profile.id, profile.learning_velocity, profile.retention_rate
                    );
                }
            }
        },

        Commands::Concept(cmd) => match cmd {
            ConceptCommands::Add {
                name,
                subject,
                topic,
                subtopic,
                description,
                difficulty,
                prereqs,
                tags,
                minutes,
            } => {
                let concept = mastery.create_concept(NewConcept {
                    name,
                    description,
                    subject,
                    topic,
                    subtopic,
                    difficulty,
                    prerequisite_ids: split_list(prereqs.as_deref()),
                    tags: split_list(tags.as_deref()),
                    estimated_time_minutes: minutes.unwrap_or(0),
                })?;

                if cli.json {
                    print_json(&concept)?;
                } else {
                    println!("Added concept '{}' with ID: {}", concept.name, concept.id);
                }
            }

            ConceptCommands::List { subject } => {
                let concepts = mastery.list_concepts(subject.as_deref())?;
                if cli.json {
                    print_json(&concepts)?;
                } else if concepts.is_empty() {
                    println!("No concepts found.");
                } else {
                    println!("{:<38} {:<30} {:<20} DIFF", "ID", "NAME", "SUBJECT");
                    println!("{}", "-".repeat(95));
                    for c in concepts {
                        println!(
                            "{:<38} {:<30} {:<20} {}",
                            c.id,
                            truncate(&c.name, 28),
                            truncate(&c.subject, 18),
                            c.difficulty
                        );
                    }
                }
            }

            ConceptCommands::Show { id } => {
                let concept = mastery.get_concept(&id)?;
                if cli.json {
                    print_json(&concept)?;
                } else {
                    println!("Concept: {}", concept.name);
                    println!("ID: {}", concept.id);
                    if let Some(desc) = &concept.description {
                        println!("Description: {}", desc);
                    }
                    println!(
                        "Subject: {} / {} / {}",
                        concept.subject,
                        concept.topic,
                        or_dash(concept.subtopic.as_deref())
                    );
                    println!("Difficulty: {}/10", concept.difficulty);
                    println!("Estimated time: {} min", concept.estimated_time_minutes);
                    println!(
                        "Prerequisites: {}",
                        if concept.prerequisite_ids.is_empty() {
                            "-".to_string()
                        } else {
                            concept.prerequisite_ids.join(", ")
                        }
                    );
                    println!(
                        "Tags: {}",
                        if concept.tags.is_empty() {
                            "-".to_string()
                        } else {
                            concept.tags.join(", ")
                        }
                    );
                }
            }

            ConceptCommands::Prereqs { id, set } => {
                let concept = mastery.update_prerequisites(&id, &split_list(Some(&set)))?;
                if cli.json {
                    print_json(&concept)?;
                } else {
                    println!(
                        "Concept {} now has {} prerequisite(s).",
                        concept.id,
                        concept.prerequisite_ids.len()
                    );
                }
            }
        },

        Commands::Practice {
            profile,
            concept,
            correct,
            incorrect,
            score,
            confidence,
        } => {
            let update = PracticeUpdate {
                correct: flag_pair(correct, incorrect),
                direct_score: score,
                direct_confidence: confidence,
            };
            let record = mastery.record_practice(&profile, &concept, update)?;

            if cli.json {
                print_json(&record)?;
            } else {
                println!("Practice recorded for concept {}.", concept);
                println!(
                    "Mastery: {} ({:.0}%), {}/{} correct",
                    record.mastery_level.label(),
                    record.mastery_score * 100.0,
                    record.correct_count,
                    record.attempts_count
                );
                println!(
                    "Next review: {} (interval {} days, ease {:.2})",
                    record.next_review_at, record.review_interval_days, record.ease_factor
                );
            }
        }

        Commands::Due { profile, limit } => {
            let due = mastery.due_for_review(&profile, limit)?;
            if cli.json {
                print_json(&due)?;
            } else if due.is_empty() {
                println!("Nothing due for review.");
            } else {
                println!("{:<38} {:<12} {:<8} DUE", "CONCEPT", "LEVEL", "SCORE");
                println!("{}", "-".repeat(90));
                for r in due {
                    println!(
                        "{:<38} {:<12} {:<8} {}",
                        r.concept_id,
                        r.mastery_level.label(),
                        format!("{:.0}%", r.mastery_score * 100.0),
                        r.next_review_at
                    );
                }
            }
        }

        Commands::Next { profile } => {
            if let Some(candidate) = mastery.next_concept_to_review(&profile)? {
                if cli.json {
                    print_json(&candidate)?;
                } else {
                    println!("=== Next Concept to Review ===");
                    println!();
                    println!("Concept: {} (ID: {})", candidate.concept.name, candidate.concept.id);
                    if let Some(desc) = &candidate.concept.description {
                        println!("Description: {}", desc);
                    }
                    println!(
                        "Current mastery: {} ({:.0}%)",
                        candidate.record.mastery_level.label(),
                        candidate.record.mastery_score * 100.0
                    );
                    println!("Due since: {}", candidate.record.next_review_at);
                    println!();
                    println!("After practising, record the result with:");
                    println!(
                        "  learntwin practice {} {} --correct|--incorrect",
                        profile, candidate.concept.id
                    );
                }
            } else if cli.json {
                print_json(())?;
            } else {
                println!("Nothing due for review.");
            }
        }

        Commands::Activity { profile } => {
            let profile = mastery.record_activity(&profile)?;
            if cli.json {
                print_json(&profile)?;
            } else {
                println!(
                    "Streak: {} days (longest {}).",
                    profile.current_streak_days, profile.longest_streak_days
                );
            }
        }

        Commands::Modality(cmd) => match cmd {
            ModalityCommands::Feedback {
                profile,
                modality,
                success,
                failure,
                rate,
            } => {
                let outcome = flag_pair(success, failure).ok_or("Specify --success or --failure")?;
                let prefs = mastery.adjust_modality_preference(&profile, &modality, outcome, rate)?;
                if cli.json {
                    print_json(&prefs)?;
                } else {
                    println!("Preferred style is now: {}", prefs.preferred().as_str());
                }
            }

            ModalityCommands::Show { profile } => {
                let prefs = mastery.get_profile(&profile)?.modality_preferences;
                if cli.json {
                    print_json(serde_json::json!({
                        "preferences": prefs,
                        "preferred": prefs.preferred()
                    }))?;
                } else {
                    for m in Modality::ALL {
                        let marker = if m == prefs.preferred() { "*" } else { " " };
                        println!("{} {:<12} {:.2}", marker, m.as_str(), prefs.get(m));
                    }
                }
            }
        },

        Commands::Misconception(cmd) => match cmd {
            MisconceptionCommands::Add {
                profile,
                concept,
                description,
                belief,
                correct,
                severity,
            } => {
                let severity = MisconceptionSeverity::from_str(&severity).ok_or_else(|| {
                    format!("Invalid severity '{}'. Use: low, medium, high, critical", severity)
                })?;
                let m = mastery.raise_misconception(
                    &profile,
                    NewMisconception {
                        concept_id: concept,
                        description,
                        learner_belief: belief,
                        correct_understanding: correct,
                        severity,
                        ..Default::default()
                    },
                )?;
                if cli.json {
                    print_json(&m)?;
                } else {
                    println!("Flagged misconception {}.", m.id);
                }
            }

            MisconceptionCommands::List { profile } => {
                let active = mastery.active_misconceptions(&profile)?;
                if cli.json {
                    print_json(&active)?;
                } else if active.is_empty() {
                    println!("No active misconceptions.");
                } else {
                    for m in active {
                        println!("[{}] {} ({})", m.severity.as_str(), m.id, m.detection_source);
                        println!("  Believes: {}", m.learner_belief);
                        println!("  Correct:  {}", m.correct_understanding);
                    }
                }
            }

            MisconceptionCommands::Resolve { id, notes } => {
                let m = mastery.resolve_misconception(&id, notes.as_deref())?;
                if cli.json {
                    print_json(&m)?;
                } else {
                    println!("Misconception {} resolved.", m.id);
                }
            }
        },

        Commands::Session(cmd) => match cmd {
            SessionCommands::Start {
                profile,
                session_type,
                concepts,
            } => {
                let kind = SessionType::from_str(&session_type).ok_or_else(|| {
                    format!(
                        "Invalid session type '{}'. Use: lesson, practice, assessment, chat",
                        session_type
                    )
                })?;
                let session = mastery.start_session(&profile, kind, split_list(concepts.as_deref()))?;
                if cli.json {
                    print_json(&session)?;
                } else {
                    println!("Started {} session {}.", kind.as_str(), session.id);
                }
            }

            SessionCommands::End {
                id,
                duration,
                attempted,
                correct,
                focus,
            } => {
                let session = mastery.end_session(
                    &id,
                    SessionStats {
                        duration_minutes: duration,
                        questions_attempted: attempted,
                        questions_correct: correct,
                        focus_score: focus,
                    },
                )?;
                if cli.json {
                    print_json(&session)?;
                } else {
                    println!("Session {} ended after {} min.", session.id, session.duration_minutes);
                }
            }

            SessionCommands::List { profile } => {
                let sessions = mastery.list_sessions(&profile)?;
                if cli.json {
                    print_json(&sessions)?;
                } else if sessions.is_empty() {
                    println!("No sessions found.");
                } else {
                    println!("{:<38} {:<12} {:<8} STARTED", "ID", "TYPE", "MIN");
                    println!("{}", "-".repeat(90));
                    for s in sessions {
                        println!(
                            "{:<38} {:<12} {:<8} {}",
                            s.id,
                            s.session_type.as_str(),
                            s.duration_minutes,
                            s.started_at
                        );
                    }
                }
            }
        },

        Commands::Analytics { profile } => {
            let a = mastery.analytics(&profile)?;
            if cli.json {
                print_json(&a)?;
            } else {
                println!("=== Learning Analytics ===");
                println!("Overall progress: {:.1}%", a.overall_progress);
                println!("Overall mastery: {:.0}%", a.overall_mastery_score * 100.0);
                for (level, count) in &a.concepts_by_mastery {
                    println!("  {:<12} {}", level, count);
                }
                for (subject, pct) in &a.subjects_progress {
                    println!("Subject {}: {:.1}%", subject, pct);
                }
                println!("Strengths: {}", a.top_strengths.join(", "));
                println!("Needs work: {}", a.areas_for_improvement.join(", "));
                println!("Recommended next: {}", a.recommended_next_concepts.join(", "));
                println!(
                    "Streak: {} days (longest {})",
                    a.streak_info.current, a.streak_info.longest
                );
                println!("Active misconceptions: {}", a.active_misconceptions);
            }
        }

        Commands::Graph { profile } => {
            let graph = mastery.knowledge_graph(&profile)?;
            if cli.json {
                print_json(&graph)?;
            } else {
                for node in &graph.nodes {
                    println!("{} [{}] {:.0}%", node.name, node.mastery_level.label(), node.mastery_score * 100.0);
                }
                for edge in &graph.edges {
                    println!("  {} -> {}", edge.source, edge.target);
                }
            }
        }

        Commands::Academic(cmd) => match cmd {
            AcademicCommands::Add {
                title,
                source_name,
                source_type,
                subject,
                topic,
                subtopic,
                grade,
                difficulty,
                tags,
                file,
                content,
            } => {
                let source_type = SourceType::from_str(&source_type).ok_or_else(|| {
                    format!(
                        "Invalid source type '{}'. Use: textbook, lecture, pdf, curriculum",
                        source_type
                    )
                })?;
                let content = match (file, content) {
                    (Some(path), _) => std::fs::read_to_string(path)?,
                    (None, Some(text)) => text,
                    (None, None) => return Err("Provide --file or --content".into()),
                };

                let chunks = fusion
                    .add_academic_document(NewAcademicDocument {
                        title,
                        source_type,
                        source_name,
                        content,
                        subject,
                        topic,
                        subtopic,
                        grade_level: grade,
                        tags: split_list(tags.as_deref()),
                        difficulty,
                    })
                    .await?;

                if cli.json {
                    print_json(&chunks)?;
                } else if let Some(first) = chunks.first() {
                    println!(
                        "Added document {} '{}' in {} chunk(s).",
                        first.document_id,
                        first.title,
                        chunks.len()
                    );
                }
            }

            AcademicCommands::List { subject, topic, limit } => {
                let chunks = fusion.list_academic_documents(subject.as_deref(), topic.as_deref(), limit)?;
                if cli.json {
                    print_json(&chunks)?;
                } else if chunks.is_empty() {
                    println!("No academic documents found.");
                } else {
                    println!("{:<38} {:<30} {:<6} {:<20} VERIFIED", "DOCUMENT", "TITLE", "CHUNK", "SOURCE");
                    println!("{}", "-".repeat(110));
                    for c in chunks {
                        println!(
                            "{:<38} {:<30} {:<6} {:<20} {}",
                            c.document_id,
                            truncate(&c.title, 28),
                            format!("{}/{}", c.chunk_index + 1, c.total_chunks),
                            truncate(&c.source_name, 18),
                            if c.is_verified { "yes" } else { "no" }
                        );
                    }
                }
            }

            AcademicCommands::Retract { document_id } => {
                let removed = fusion.retract_academic_document(&document_id).await?;
                if cli.json {
                    print_json(serde_json::json!({ "document_id": document_id, "removed": removed }))?;
                } else {
                    println!("Retracted document {} ({} index entries removed).", document_id, removed);
                }
            }
        },

        Commands::Context(ContextCommands::Add {
            profile,
            content,
            context_type,
            concept,
            concept_name,
            subject,
            topic,
            correct,
            incorrect,
            confidence,
        }) => {
            let kind = ContextType::from_str(&context_type).ok_or_else(|| {
                format!(
                    "Invalid context type '{}'. Use: question, explanation, chat, assessment",
                    context_type
                )
            })?;
            let evidence = fusion
                .add_learner_context(
                    &profile,
                    NewLearnerContext {
                        concept_id: concept,
                        concept_name,
                        subject,
                        topic,
                        was_correct: flag_pair(correct, incorrect),
                        confidence_score: confidence,
                        ..NewLearnerContext::new(kind, content)
                    },
                )
                .await?;

            if cli.json {
                print_json(&evidence)?;
            } else {
                println!("Recorded learner context {}.", evidence.id);
            }
        }

        Commands::Ask {
            profile,
            query,
            session,
            concept,
            subject,
            topic,
            modality,
            no_history,
            no_academic,
            learner_k,
            academic_k,
        } => {
            let response = fusion
                .query(QueryRequest {
                    session_id: session,
                    concept_id: concept,
                    subject,
                    topic,
                    include_learner_context: !no_history,
                    include_academic_sources: !no_academic,
                    max_learner_results: learner_k,
                    max_academic_results: academic_k,
                    modality_override: parse_modality(modality.as_deref())?,
                    ..QueryRequest::new(profile, query)
                })
                .await?;

            if cli.json {
                print_json(&response)?;
            } else {
                println!("{}", response.answer);
                println!();
                println!(
                    "[style: {} | confidence: {:.2} | sources: {}]",
                    response.modality_used.as_str(),
                    response.confidence_score,
                    if response.sources_cited.is_empty() {
                        "-".to_string()
                    } else {
                        response.sources_cited.join(", ")
                    }
                );
                for gap in &response.gaps_detected {
                    println!("Gap ({}): {}", gap.severity.as_str(), gap.description);
                }
            }
        }

        Commands::Explain {
            profile,
            concept,
            question,
            session,
            modality,
        } => {
            let explanation = fusion
                .explain_concept(ExplainRequest {
                    profile_id: profile,
                    concept_id: concept,
                    question,
                    session_id: session,
                    modality_override: parse_modality(modality.as_deref())?,
                })
                .await?;

            if cli.json {
                print_json(&explanation)?;
            } else {
                println!("=== {} ===", explanation.concept_name);
                println!();
                println!("{}", explanation.explanation);
                println!();
                println!("Follow-up questions:");
                for q in &explanation.follow_up_questions {
                    println!("  - {}", q);
                }
            }
        }

        Commands::Search {
            query,
            source,
            subject,
            topic,
            limit,
            profile,
        } => {
            let source = SearchSource::from_str(&source)
                .ok_or_else(|| format!("Invalid source '{}'. Use: learner, academic, all", source))?;
            let results = fusion
                .semantic_search(SearchQuery {
                    query,
                    source,
                    subject,
                    topic,
                    limit,
                    profile_id: profile,
                })
                .await?;

            if cli.json {
                print_json(&results)?;
            } else if results.is_empty() {
                println!("No matches.");
            } else {
                for r in results {
                    println!(
                        "{:.3} [{}] {}",
                        r.relevance_score,
                        r.kind.as_str(),
                        truncate(&r.content.replace('\n', " "), 100)
                    );
                }
            }
        }

        Commands::Gaps(cmd) => match cmd {
            GapCommands::List { profile } => {
                let gaps = fusion.unresolved_gaps(&profile)?;
                if cli.json {
                    print_json(&gaps)?;
                } else if gaps.is_empty() {
                    println!("No unresolved gaps.");
                } else {
                    for g in gaps {
                        println!("[{:.2}] {} {} ({})", g.priority_score, g.id, g.concept_name, g.severity.as_str());
                        println!("  {}", g.description);
                    }
                }
            }

            GapCommands::Resolve { id, strategy } => {
                let gap = fusion.resolve_gap(&id, &strategy)?;
                if cli.json {
                    print_json(&gap)?;
                } else {
                    println!("Gap {} resolved.", gap.id);
                }
            }
        },

        Commands::Chat(cmd) => match cmd {
            ChatCommands::History { profile, session, limit } => {
                let turns = fusion.chat_history(&profile, session.as_deref(), limit)?;
                if cli.json {
                    print_json(&turns)?;
                } else if turns.is_empty() {
                    println!("No messages.");
                } else {
                    for t in turns.iter().rev() {
                        println!("{} [{}] {}", t.created_at, t.role.as_str(), truncate(&t.content, 100));
                    }
                }
            }

            ChatCommands::Feedback { id, helpful, unhelpful } => {
                let helpful = flag_pair(helpful, unhelpful).ok_or("Specify --helpful or --unhelpful")?;
                fusion.submit_feedback(&id, helpful)?;
                if cli.json {
                    print_json(())?;
                } else {
                    println!("Feedback recorded for message {}.", id);
                }
            }
        },

        Commands::Stats => {
            let stats = db.get_stats(Utc::now())?;
            let index_stats = fusion.index_stats().await?;
            if cli.json {
                print_json(serde_json::json!({
                    "store": stats,
                    "index": index_stats
                }))?;
            } else {
                println!("=== Learning Statistics ===");
                println!("Profiles: {}", stats.profiles);
                println!("Concepts: {}", stats.concepts);
                println!("Mastery records: {}", stats.mastery_records);
                println!("Mastered: {}", stats.mastered);
                println!("Due for review: {}", stats.due_now);
                println!("Average mastery: {:.0}%", stats.avg_mastery * 100.0);
                println!("Active misconceptions: {}", stats.active_misconceptions);
                println!("Chat messages: {}", stats.chat_turns);
                println!(
                    "Evidence: {} learner ({} indexed), {} academic chunks ({} indexed)",
                    stats.learner_evidence, index_stats.learner_history, stats.academic_chunks, index_stats.academic
                );
            }
        }
    }

    Ok(())
}

/// Shortens to `max_len` characters, ending with "..." when cut.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
