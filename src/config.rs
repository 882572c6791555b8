use std::path::Path;

use serde::Deserialize;

/// Default cap on concurrently open client connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 2000;

/// Upper bound accepted from the config file.
const MAX_CONNECTIONS_CEILING: u64 = 100_000;

/// Server configuration loaded from `config.json`.
///
/// The file is parsed permissively: a missing file, malformed JSON, or an
/// out-of-range value all fall back to the defaults with a warning rather
/// than failing startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub max_connections: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

#[derive(Deserialize)]
struct RawConfig {
    max_connections: Option<u64>,
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(_) => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Self::default();
            }
        };

        let parsed: RawConfig = match serde_json::from_str(&raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unparseable config, using defaults");
                return Self::default();
            }
        };

        let mut config = Self::default();
        if let Some(n) = parsed.max_connections {
            if n >= 1 && n <= MAX_CONNECTIONS_CEILING {
                config.max_connections = n as usize;
            } else {
                tracing::warn!(
                    max_connections = n,
                    "max_connections out of range, using default {}",
                    DEFAULT_MAX_CONNECTIONS
                );
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn valid_value_is_used() {
        let file = write_config(r#"{"max_connections": 512}"#);
        let config = Config::load(file.path());
        assert_eq!(config.max_connections, 512);
    }

    #[test]
    fn missing_file_uses_default() {
        let config = Config::load(Path::new("/nonexistent/config.json"));
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
    }

    #[test]
    fn garbage_json_uses_default() {
        let file = write_config("{not json");
        let config = Config::load(file.path());
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let file = write_config(r#"{"max_connections": 100, "color": "blue"}"#);
        let config = Config::load(file.path());
        assert_eq!(config.max_connections, 100);
    }

    #[test]
    fn out_of_range_uses_default() {
        for contents in [r#"{"max_connections": 0}"#, r#"{"max_connections": 999999}"#] {
            let file = write_config(contents);
            let config = Config::load(file.path());
            assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        }
    }
}
