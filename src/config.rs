//! Optional config file loading. Search order: ./esjscrape.toml, then
//! $XDG_CONFIG_HOME/esjscrape/config.toml (or ~/.config/esjscrape/config.toml).

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Config file name looked up in the current directory.
pub const LOCAL_CONFIG_FILE: &str = "esjscrape.toml";

/// Config file contents. All fields optional; only present keys override defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct Config {
    /// Default output directory when -o is not set. Paths are relative to CWD.
    pub output_dir: Option<PathBuf>,
    /// HTTP User-Agent header.
    pub user_agent: Option<String>,
    /// Minimum delay in milliseconds between requests, shared by all threads.
    pub request_delay_ms: Option<u64>,
    /// Request timeout in seconds.
    pub timeout_secs: Option<u64>,
    /// Number of HTTP attempts for transient failures (default 3).
    pub retry_count: Option<u32>,
    /// Delay in seconds before each retry. The last value is reused. Default [10].
    pub retry_backoff_secs: Option<Vec<u64>>,
    /// Download threads (default 4).
    pub threads: Option<usize>,
    /// File holding the raw Cookie header of a logged-in session.
    pub cookie_file: Option<PathBuf>,
    /// Script conversion: t2s (default), s2t, or none.
    pub conversion: Option<String>,
    /// Include a visible table-of-contents page after the cover in EPUB (default: true).
    pub toc_page: Option<bool>,
}

/// Parse config TOML. `origin` only labels the error message.
pub fn parse_config(s: &str, origin: &Path) -> Result<Config, String> {
    toml::from_str(s).map_err(|e| format!("Invalid config {}: {}", origin.display(), e))
}

/// Search order: (1) ./esjscrape.toml, (2) $XDG_CONFIG_HOME/esjscrape/config.toml.
/// Missing file returns Ok(None). Invalid TOML or I/O error reading a present file returns Err.
pub fn load_config() -> Result<Option<Config>, String> {
    let cwd = std::env::current_dir()
        .map_err(|e| format!("Cannot determine current directory: {}", e))?;
    let mut paths = vec![cwd.join(LOCAL_CONFIG_FILE)];
    if let Some(d) = dirs::config_dir() {
        paths.push(d.join("esjscrape").join("config.toml"));
    }
    for path in &paths {
        if path.exists() {
            let s = std::fs::read_to_string(path)
                .map_err(|e| format!("Cannot read config {}: {}", path.display(), e))?;
            return parse_config(&s, path).map(Some);
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Result<Config, String> {
        parse_config(s, Path::new("test.toml"))
    }

    #[test]
    fn parse_empty_config() -> Result<(), String> {
        let c = parse("")?;
        assert!(c.output_dir.is_none());
        assert!(c.user_agent.is_none());
        assert!(c.request_delay_ms.is_none());
        assert!(c.timeout_secs.is_none());
        assert!(c.retry_count.is_none());
        assert!(c.retry_backoff_secs.is_none());
        assert!(c.threads.is_none());
        assert!(c.cookie_file.is_none());
        assert!(c.conversion.is_none());
        assert!(c.toc_page.is_none());
        Ok(())
    }

    #[test]
    fn parse_full_config() -> Result<(), String> {
        let c = parse(
            r#"
            output_dir = "out"
            user_agent = "Custom/1.0"
            request_delay_ms = 500
            timeout_secs = 60
            retry_count = 5
            retry_backoff_secs = [5, 10]
            threads = 8
            cookie_file = "cookies/esj.txt"
            conversion = "s2t"
            toc_page = false
        "#,
        )?;
        assert_eq!(c.output_dir.as_deref(), Some(Path::new("out")));
        assert_eq!(c.user_agent.as_deref(), Some("Custom/1.0"));
        assert_eq!(c.request_delay_ms, Some(500));
        assert_eq!(c.timeout_secs, Some(60));
        assert_eq!(c.retry_count, Some(5));
        assert_eq!(c.retry_backoff_secs.as_deref(), Some([5, 10].as_slice()));
        assert_eq!(c.threads, Some(8));
        assert_eq!(c.cookie_file.as_deref(), Some(Path::new("cookies/esj.txt")));
        assert_eq!(c.conversion.as_deref(), Some("s2t"));
        assert_eq!(c.toc_page, Some(false));
        Ok(())
    }

    #[test]
    fn parse_partial_config() -> Result<(), String> {
        let c = parse("threads = 2")?;
        assert_eq!(c.threads, Some(2));
        assert!(c.output_dir.is_none());
        assert!(c.request_delay_ms.is_none());
        Ok(())
    }

    #[test]
    fn invalid_toml_names_the_file() {
        let err = parse("output_dir = [").err().unwrap_or_default();
        assert!(err.starts_with("Invalid config test.toml"));
    }

    #[test]
    fn wrong_type_is_an_error() {
        assert!(parse("threads = \"many\"").is_err());
    }
}
