use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_DB_NAME: &str = "learntwin.db";
const DEFAULT_INDEX_DB_NAME: &str = "index.db";
const DEFAULT_TOP_K: usize = 5;
const DEFAULT_GAP_TIMEOUT_MS: u64 = 20_000;
const DEFAULT_SYNTHESIS_TIMEOUT_MS: u64 = 45_000;
const DEFAULT_SEARCH_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_CHUNK_CHARS: usize = 1200;

/// Tunables for the query pipeline.
#[derive(Debug, Clone)]
pub struct FusionSettings {
    pub top_k_learner: usize,
    pub top_k_academic: usize,
    pub search_timeout: Duration,
    pub gap_timeout: Duration,
    pub synthesis_timeout: Duration,
    pub chunk_chars: usize,
}

impl Default for FusionSettings {
    fn default() -> Self {
        Self {
            top_k_learner: DEFAULT_TOP_K,
            top_k_academic: DEFAULT_TOP_K,
            search_timeout: Duration::from_millis(DEFAULT_SEARCH_TIMEOUT_MS),
            gap_timeout: Duration::from_millis(DEFAULT_GAP_TIMEOUT_MS),
            synthesis_timeout: Duration::from_millis(DEFAULT_SYNTHESIS_TIMEOUT_MS),
            chunk_chars: DEFAULT_CHUNK_CHARS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub index_db_path: PathBuf,
    pub fusion: FusionSettings,
}

impl Config {
    pub fn from_env() -> Self {
        let db_path = env_string("LEARNTWIN_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|| default_data_dir().join(DEFAULT_DB_NAME));

        let index_db_path = env_string("LEARNTWIN_INDEX_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|| sibling_path(&db_path, DEFAULT_INDEX_DB_NAME));

        let fusion = FusionSettings {
            top_k_learner: env_usize("LEARNTWIN_TOP_K_LEARNER").unwrap_or(DEFAULT_TOP_K),
            top_k_academic: env_usize("LEARNTWIN_TOP_K_ACADEMIC").unwrap_or(DEFAULT_TOP_K),
            search_timeout: Duration::from_millis(
                env_u64("LEARNTWIN_SEARCH_TIMEOUT_MS").unwrap_or(DEFAULT_SEARCH_TIMEOUT_MS),
            ),
            gap_timeout: Duration::from_millis(
                env_u64("LEARNTWIN_GAP_TIMEOUT_MS").unwrap_or(DEFAULT_GAP_TIMEOUT_MS),
            ),
            synthesis_timeout: Duration::from_millis(
                env_u64("LEARNTWIN_SYNTHESIS_TIMEOUT_MS").unwrap_or(DEFAULT_SYNTHESIS_TIMEOUT_MS),
            ),
            chunk_chars: env_usize("LEARNTWIN_CHUNK_CHARS")
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_CHUNK_CHARS),
        };

        Self {
            db_path,
            index_db_path,
            fusion,
        }
    }
}

fn default_data_dir() -> PathBuf {
    let dir = dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("learntwin");

    std::fs::create_dir_all(&dir).ok();
    dir
}

fn sibling_path(path: &std::path::Path, name: &str) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(name),
        _ => PathBuf::from(name),
    }
}

pub(crate) fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

pub(crate) fn env_u64(key: &str) -> Option<u64> {
    env_string(key)?.trim().parse().ok()
}

fn env_usize(key: &str) -> Option<usize> {
    env_string(key)?.trim().parse().ok()
}
