use std::path::PathBuf;

pub(crate) const LOG_ENV: &str = "UBEACON_LOG";
pub(crate) const LOG_FILE_ENV: &str = "UBEACON_LOG_FILE";
pub(crate) const TRACE_NEW_THREADS_ENV: &str = "UBEACON_TRACE_NEW_THREADS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// `EnvFilter` directive. `None` keeps logging off entirely.
    pub log_filter: Option<String>,
    pub log_file: Option<PathBuf>,
    pub trace_new_threads: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            log_filter: None,
            log_file: None,
            trace_new_threads: true,
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        Self {
            log_filter: non_empty(LOG_ENV),
            log_file: non_empty(LOG_FILE_ENV).map(PathBuf::from),
            trace_new_threads: non_empty(TRACE_NEW_THREADS_ENV)
                .is_none_or(|value| value != "0"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> AgentConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AgentConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_keep_logging_off() {
        assert_eq!(config(&[]), AgentConfig::default());
    }

    #[test]
    fn blank_values_count_as_unset() {
        let cfg = config(&[(LOG_ENV, "  "), (LOG_FILE_ENV, "")]);
        assert_eq!(cfg.log_filter, None);
        assert_eq!(cfg.log_file, None);
    }

    #[test]
    fn reads_every_variable() {
        let cfg = config(&[
            (LOG_ENV, "ubeacon=debug"),
            (LOG_FILE_ENV, "/tmp/ubeacon.log"),
            (TRACE_NEW_THREADS_ENV, "0"),
        ]);
        assert_eq!(cfg.log_filter.as_deref(), Some("ubeacon=debug"));
        assert_eq!(cfg.log_file, Some(PathBuf::from("/tmp/ubeacon.log")));
        assert!(!cfg.trace_new_threads);
    }

    #[test]
    fn only_zero_disables_new_thread_hook() {
        assert!(config(&[(TRACE_NEW_THREADS_ENV, "1")]).trace_new_threads);
        assert!(config(&[(TRACE_NEW_THREADS_ENV, "no")]).trace_new_threads);
    }
}
