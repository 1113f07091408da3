use crate::config::AgentConfig;
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Installs the agent's subscriber when `UBEACON_LOG` is set. The monitored
/// program owns stdout and stderr, so nothing is installed otherwise, and a
/// failure is reported once on stderr rather than propagated.
pub(crate) fn init(config: &AgentConfig) {
    if let Err(message) = install(config) {
        eprintln!("ubeacon: {message}");
    }
}

/// Returns whether a subscriber was installed.
fn install(config: &AgentConfig) -> Result<bool, String> {
    let Some(directive) = config.log_filter.as_deref() else {
        return Ok(false);
    };
    let filter = EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|err| format!("cannot open log file {}: {err}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init(),
    };
    // The host may have installed its own global subscriber first.
    installed
        .map(|()| true)
        .map_err(|err| format!("logging not installed: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nothing_is_installed_without_a_filter() {
        assert_eq!(install(&AgentConfig::default()), Ok(false));
    }

    #[test]
    fn unopenable_log_file_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = AgentConfig {
            log_filter: Some("debug".into()),
            log_file: Some(dir.path().join("missing").join("agent.log")),
            ..AgentConfig::default()
        };
        let err = install(&config).expect_err("parent directory is missing");
        assert!(err.starts_with("cannot open log file "), "{err}");
    }

    #[test]
    fn second_global_subscriber_is_reported() {
        let config = AgentConfig {
            log_filter: Some("ubeacon=debug".into()),
            ..AgentConfig::default()
        };
        // The first call may lose to another subscriber; the second always
        // finds the global slot taken.
        let _ = install(&config);
        let err = install(&config).expect_err("the global subscriber is already set");
        assert!(err.starts_with("logging not installed: "), "{err}");
    }
}
