use std::time::Duration;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Deepest re-entry level. Depth 0 is the first model call, so a
    /// turn makes at most `max_recursion_depth + 1` model calls.
    #[serde(default = "d_max_recursion_depth")]
    pub max_recursion_depth: u32,
    /// Minimum time between two token-chunk flushes.
    #[serde(default = "d_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Buffer size (in characters) that forces a flush regardless of time.
    #[serde(default = "d_flush_threshold_chars")]
    pub flush_threshold_chars: usize,
    /// Delay between a turn reaching a terminal status and its chunks
    /// being deleted.
    #[serde(default = "d_chunk_grace_ms")]
    pub chunk_grace_ms: u64,
    /// Delay between an abort being observed and the chunk purge.
    #[serde(default = "d_abort_purge_delay_ms")]
    pub abort_purge_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_recursion_depth: d_max_recursion_depth(),
            flush_interval_ms: d_flush_interval_ms(),
            flush_threshold_chars: d_flush_threshold_chars(),
            chunk_grace_ms: d_chunk_grace_ms(),
            abort_purge_delay_ms: d_abort_purge_delay_ms(),
        }
    }
}

impl EngineConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn chunk_grace(&self) -> Duration {
        Duration::from_millis(self.chunk_grace_ms)
    }

    pub fn abort_purge_delay(&self) -> Duration {
        Duration::from_millis(self.abort_purge_delay_ms)
    }
}

fn d_max_recursion_depth() -> u32 {
    10
}
fn d_flush_interval_ms() -> u64 {
    60
}
fn d_flush_threshold_chars() -> usize {
    100
}
fn d_chunk_grace_ms() -> u64 {
    1_000
}
fn d_abort_purge_delay_ms() -> u64 {
    1_000
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Duplicate-action detection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicatesConfig {
    /// Prior records older than this are never considered repeats.
    #[serde(default = "d_window_secs")]
    pub window_secs: u64,
    /// Normalized Levenshtein similarity at or above which two texts
    /// count as the same.
    #[serde(default = "d_text_similarity")]
    pub text_similarity: f64,
}

impl Default for DuplicatesConfig {
    fn default() -> Self {
        Self {
            window_secs: d_window_secs(),
            text_similarity: d_text_similarity(),
        }
    }
}

impl DuplicatesConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

fn d_window_secs() -> u64 {
    600
}
fn d_text_similarity() -> f64 {
    0.85
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Action log
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionsConfig {
    /// Oldest records beyond this count are evicted on append.
    #[serde(default = "d_max_records")]
    pub max_records_per_conversation: usize,
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            max_records_per_conversation: d_max_records(),
        }
    }
}

fn d_max_records() -> usize {
    500
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Todo processing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodoConfig {
    /// Watch-mode timeout used when the caller does not pass one.
    #[serde(default = "d_default_watch_timeout_secs")]
    pub default_watch_timeout_secs: u64,
    /// Upper bound for caller-supplied watch timeouts.
    #[serde(default = "d_max_watch_timeout_secs")]
    pub max_watch_timeout_secs: u64,
}

impl Default for TodoConfig {
    fn default() -> Self {
        Self {
            default_watch_timeout_secs: d_default_watch_timeout_secs(),
            max_watch_timeout_secs: d_max_watch_timeout_secs(),
        }
    }
}

impl TodoConfig {
    /// Clamp a requested timeout to the configured maximum.
    pub fn watch_timeout(&self, requested_secs: Option<u64>) -> Duration {
        let secs = requested_secs
            .unwrap_or(self.default_watch_timeout_secs)
            .min(self.max_watch_timeout_secs);
        Duration::from_secs(secs)
    }
}

fn d_default_watch_timeout_secs() -> u64 {
    300
}
fn d_max_watch_timeout_secs() -> u64 {
    1_800
}
