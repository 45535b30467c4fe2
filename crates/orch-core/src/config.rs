use std::env;

/// Process-wide configuration, resolved once at startup from the
/// environment (§6.1). Constructed explicitly and threaded through the
/// binary into the server and engine rather than read ambiently from env
/// at point of use (§9 "global mutable state").
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    pub adapter_base_url: Option<String>,
    pub adapter_secret: Option<String>,
    pub adapter_cwd: Option<String>,
    pub allow_mock_runs: bool,
    pub host: String,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            db_path: env::var("ORCH_DB_PATH").unwrap_or_else(|_| ":memory:".to_string()),
            adapter_base_url: env::var("ORCH_ADAPTER_BASE_URL").ok().filter(|s| !s.is_empty()),
            adapter_secret: env::var("ORCH_ADAPTER_SECRET").ok().filter(|s| !s.is_empty()),
            adapter_cwd: env::var("ORCH_ADAPTER_CWD").ok().filter(|s| !s.is_empty()),
            allow_mock_runs: env_flag("ORCH_ALLOW_MOCK_RUNS"),
            host: env::var("ORCH_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("ORCH_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
        }
    }

    pub fn uses_live_adapter(&self) -> bool {
        self.adapter_base_url.is_some()
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        env::var(name).ok().as_deref(),
        Some("1") | Some("true") | Some("TRUE") | Some("yes")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_memory_and_mock() {
        // SAFETY: single-threaded test, no concurrent env mutation.
        unsafe {
            env::remove_var("ORCH_DB_PATH");
            env::remove_var("ORCH_ADAPTER_BASE_URL");
            env::remove_var("ORCH_ALLOW_MOCK_RUNS");
        }
        let cfg = Config::from_env();
        assert_eq!(cfg.db_path, ":memory:");
        assert!(!cfg.uses_live_adapter());
        assert!(!cfg.allow_mock_runs);
    }
}
