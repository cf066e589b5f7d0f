//! Configuration surface: every value is optional and defaults the way
//! spec.md §6 documents, read once at startup from environment variables
//! following the teacher's `std::env::var(..).ok().and_then(..)` idiom.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub store_path: PathBuf,
    pub awareness_path: PathBuf,
    pub schema_path: PathBuf,
    pub lm_host: String,
    pub lm_model: String,
    pub lm_enabled: bool,
    pub tick_enabled: bool,
    pub tick_interval_ms: u64,
    pub tick_wall_cap_ms: u64,
    pub deep_cache_ttl_ms: u64,
    pub pending_ttl_ms: u64,
    pub auto_approve_low: bool,
    pub auto_approve_medium: bool,
    pub auto_approve_high: bool,
    pub rest_host: String,
    pub rest_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        let home = home_dir();
        Self {
            store_path: home.join(".context-runtime").join("store.json"),
            awareness_path: home.join(".context-runtime").join("awareness.json"),
            schema_path: home.join(".context-runtime").join("schema.json"),
            lm_host: "http://localhost:11434".to_string(),
            lm_model: "llama3".to_string(),
            lm_enabled: true,
            tick_enabled: true,
            tick_interval_ms: 300_000,
            tick_wall_cap_ms: 30_000,
            deep_cache_ttl_ms: 3_600_000,
            pending_ttl_ms: 604_800_000,
            auto_approve_low: true,
            auto_approve_medium: false,
            auto_approve_high: false,
            rest_host: "0.0.0.0".to_string(),
            rest_port: 4173,
        }
    }
}

impl Config {
    /// Reads overrides from environment variables, falling back to the
    /// documented defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            store_path: env_path("CONTEXT_RUNTIME_STORE_PATH", defaults.store_path),
            awareness_path: env_path("CONTEXT_RUNTIME_AWARENESS_PATH", defaults.awareness_path),
            schema_path: env_path("CONTEXT_RUNTIME_SCHEMA_PATH", defaults.schema_path),
            lm_host: env_string("CONTEXT_RUNTIME_LM_HOST", defaults.lm_host),
            lm_model: env_string("CONTEXT_RUNTIME_LM_MODEL", defaults.lm_model),
            lm_enabled: env_bool("CONTEXT_RUNTIME_LM_ENABLED", defaults.lm_enabled),
            tick_enabled: env_bool("CONTEXT_RUNTIME_TICK_ENABLED", defaults.tick_enabled),
            tick_interval_ms: env_u64("CONTEXT_RUNTIME_TICK_INTERVAL_MS", defaults.tick_interval_ms),
            tick_wall_cap_ms: env_u64("CONTEXT_RUNTIME_TICK_WALL_CAP_MS", defaults.tick_wall_cap_ms),
            deep_cache_ttl_ms: env_u64("CONTEXT_RUNTIME_DEEP_CACHE_TTL_MS", defaults.deep_cache_ttl_ms),
            pending_ttl_ms: env_u64("CONTEXT_RUNTIME_PENDING_TTL_MS", defaults.pending_ttl_ms),
            auto_approve_low: env_bool("CONTEXT_RUNTIME_AUTO_APPROVE_LOW", defaults.auto_approve_low),
            auto_approve_medium: env_bool(
                "CONTEXT_RUNTIME_AUTO_APPROVE_MEDIUM",
                defaults.auto_approve_medium,
            ),
            auto_approve_high: env_bool("CONTEXT_RUNTIME_AUTO_APPROVE_HIGH", defaults.auto_approve_high),
            rest_host: env_string("CONTEXT_RUNTIME_REST_HOST", defaults.rest_host),
            rest_port: env_u64("CONTEXT_RUNTIME_REST_PORT", defaults.rest_port as u64) as u16,
        }
    }
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn env_string(key: &str, default: String) -> String {
    std::env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or(default)
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    std::env::var_os(key).map(PathBuf::from).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.lm_host, "http://localhost:11434");
        assert!(config.auto_approve_low);
        assert!(!config.auto_approve_medium);
        assert!(!config.auto_approve_high);
        assert_eq!(config.tick_interval_ms, 300_000);
        assert_eq!(config.pending_ttl_ms, 604_800_000);
    }
}
