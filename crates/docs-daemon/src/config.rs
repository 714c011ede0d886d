use clap::Parser;
use docs_core::EngineConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments, with environment fallbacks.
#[derive(Parser, Debug, Clone)]
#[command(name = "docs-daemon")]
#[command(about = "Keeps a live, sorted view of the documents in an account's container")]
pub struct Args {
    /// Directory holding one container directory per identity (supports ~)
    #[arg(short, long, env = "DOCS_ROOT")]
    pub root: String,

    /// File holding the active identity token [default: <root>/.identity]
    #[arg(long, env = "DOCS_IDENTITY_FILE")]
    pub identity_file: Option<String>,

    /// Extension appended to created documents
    #[arg(long, default_value = "txt")]
    pub extension: String,

    /// Name used when `new` is given a blank name
    #[arg(long, default_value = "Untitled")]
    pub default_name: String,

    /// Change batching interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub batch_ms: u64,

    /// Give up on an unconfirmed change after this many seconds
    #[arg(long)]
    pub confirm_timeout_secs: Option<u64>,

    /// Print views and results as JSON
    #[arg(long)]
    pub json: bool,

    /// Enable verbose logging
    #[arg(long)]
    pub verbose: bool,
}

/// Validated daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub root: PathBuf,
    pub identity_file: PathBuf,
    pub engine: EngineConfig,
    pub json: bool,
}

impl Config {
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let root = expand_tilde(&args.root);
        if root.as_os_str().is_empty() {
            return Err(ConfigError::EmptyRoot);
        }
        let identity_file = match &args.identity_file {
            Some(path) => expand_tilde(path),
            None => root.join(".identity"),
        };

        let extension = args.extension.trim_start_matches('.').to_string();
        if extension.is_empty() || extension.contains(['/', '\\', '*']) {
            return Err(ConfigError::InvalidExtension(args.extension));
        }
        if args.batch_ms == 0 {
            return Err(ConfigError::ZeroBatchInterval);
        }

        Ok(Self {
            root,
            identity_file,
            engine: EngineConfig {
                extension,
                default_name: args.default_name,
                confirmation_timeout: args.confirm_timeout_secs.map(Duration::from_secs),
                batching_interval: Duration::from_millis(args.batch_ms),
            },
            json: args.json,
        })
    }
}

/// Expand ~ or ~/ prefix to the user's home directory.
fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"))
    } else if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path))
    } else {
        PathBuf::from(path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Document root must not be empty")]
    EmptyRoot,

    #[error("Invalid document extension: {0:?}")]
    InvalidExtension(String),

    #[error("Batching interval must be at least 1ms")]
    ZeroBatchInterval,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Config, ConfigError> {
        let args = Args::try_parse_from(std::iter::once("docs-daemon").chain(args.iter().copied()))
            .unwrap();
        Config::from_args(args)
    }

    #[test]
    fn test_defaults() {
        let config = parse(&["--root", "/srv/docs"]).unwrap();
        assert_eq!(config.root, PathBuf::from("/srv/docs"));
        assert_eq!(config.identity_file, PathBuf::from("/srv/docs/.identity"));
        assert_eq!(config.engine.extension, "txt");
        assert_eq!(config.engine.default_name, "Untitled");
        assert_eq!(config.engine.confirmation_timeout, None);
        assert_eq!(config.engine.batching_interval, Duration::from_secs(1));
        assert!(!config.json);
    }

    #[test]
    fn test_overrides() {
        let config = parse(&[
            "--root",
            "/srv/docs",
            "--identity-file",
            "/run/identity",
            "--extension",
            ".md",
            "--batch-ms",
            "250",
            "--confirm-timeout-secs",
            "30",
            "--json",
        ])
        .unwrap();
        assert_eq!(config.identity_file, PathBuf::from("/run/identity"));
        assert_eq!(config.engine.extension, "md");
        assert_eq!(config.engine.batching_interval, Duration::from_millis(250));
        assert_eq!(config.engine.confirmation_timeout, Some(Duration::from_secs(30)));
        assert!(config.json);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert_eq!(
            parse(&["--root", "/d", "--extension", "*"]).unwrap_err(),
            ConfigError::InvalidExtension("*".into())
        );
        assert_eq!(
            parse(&["--root", "/d", "--batch-ms", "0"]).unwrap_err(),
            ConfigError::ZeroBatchInterval
        );
        assert_eq!(parse(&["--root", ""]).unwrap_err(), ConfigError::EmptyRoot);
    }

    #[test]
    fn test_expand_tilde() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde("~/docs"), home.join("docs"));
        }
        assert_eq!(expand_tilde("/abs/path"), PathBuf::from("/abs/path"));
    }
}
