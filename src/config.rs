//! Engine configuration, loaded from environment variables in the same
//! `env_value`/default-fallback style the teacher's core crate uses.

use std::env;

/// Runtime knobs for the migration engine. Never panics on a malformed
/// env var — falls back to the documented default and lets the caller's
/// own logging surface the problem if it matters.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// `PRAGMA busy_timeout` applied to every opened connection, in
    /// milliseconds. Consumed by `driver::sqlite_native::SqliteDriver::open`.
    pub busy_timeout_ms: u64,
    /// Whether `SqliteDriver::open` itself sets `PRAGMA foreign_keys=ON`,
    /// or leaves enforcement entirely to the caller.
    pub auto_toggle_foreign_keys: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5000,
            auto_toggle_foreign_keys: true,
        }
    }
}

impl EngineConfig {
    /// Loads configuration from environment variables, falling back to
    /// [`EngineConfig::default`] for anything absent or unparseable.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.busy_timeout_ms = env_u64("MIGRATION_BUSY_TIMEOUT_MS", config.busy_timeout_ms);
        config.auto_toggle_foreign_keys = env_bool("MIGRATION_AUTO_TOGGLE_FOREIGN_KEYS", config.auto_toggle_foreign_keys);
        config
    }
}

fn env_value(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_bool(value: &str, default: bool) -> bool {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" => true,
        "0" | "false" | "f" | "no" | "n" => false,
        _ => default,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    env_value(key).map_or(default, |v| parse_bool(&v, default))
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_value(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}
