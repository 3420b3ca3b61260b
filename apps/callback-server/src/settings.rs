//! Configuration loading
//!
//! Layers, lowest priority first: built-in defaults, the TOML file,
//! `CALLBACK__*` environment variables, command-line flags.

use anyhow::{Context, Result};
use callback_receiver::ReceiverConfig;
use config::{Config, Environment, File, Map};

use crate::cli::Args;

const DEFAULT_CONFIG_FILE: &str = "config/default";
const ENV_PREFIX: &str = "CALLBACK";

/// Load settings from the process environment
pub fn load(args: &Args) -> Result<ReceiverConfig> {
    load_with_env(args, None)
}

/// Load settings, reading environment variables from `env` when given
pub fn load_with_env(args: &Args, env: Option<Map<String, String>>) -> Result<ReceiverConfig> {
    let file = match &args.config {
        Some(path) => File::from(path.as_path()).required(true),
        None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
    };

    let mut builder = Config::builder().add_source(file).add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
            .source(env),
    );

    if let Some(listen) = &args.listen {
        builder = builder.set_override("listen_addr", listen.as_str())?;
    }
    if let Some(path) = &args.path {
        builder = builder.set_override("path", path.as_str())?;
    }
    if args.no_auth {
        builder = builder.set_override("auth_enabled", false)?;
    }

    builder
        .build()
        .context("Failed to read configuration")?
        .try_deserialize()
        .context("Invalid configuration")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn env(pairs: &[(&str, &str)]) -> Option<Map<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_defaults_without_overrides() {
        let config = load_with_env(&Args::default(), env(&[])).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:8081");
        assert_eq!(config.path, "/callback");
        assert!(config.auth_enabled);
        assert_eq!(config.grace_period_ms, 5_000);
    }

    #[test]
    fn test_environment_overrides_defaults() {
        let config = load_with_env(
            &Args::default(),
            env(&[
                ("CALLBACK__CHANNEL_KEY", "key-1"),
                ("CALLBACK__CHANNEL_SECRET", "secret-1"),
                ("CALLBACK__GRACE_PERIOD_MS", "250"),
                ("CALLBACK__HANDLE_SIGNALS", "false"),
            ]),
        )
        .unwrap();
        assert_eq!(config.channel_key, "key-1");
        assert_eq!(config.channel_secret, "secret-1");
        assert_eq!(config.grace_period_ms, 250);
        assert!(!config.handle_signals);
    }

    #[test]
    fn test_flags_override_environment() {
        let args = Args {
            listen: Some("127.0.0.1:9000".to_string()),
            path: Some("/hooks/push".to_string()),
            no_auth: true,
            ..Args::default()
        };
        let config = load_with_env(
            &args,
            env(&[
                ("CALLBACK__LISTEN_ADDR", "127.0.0.1:7000"),
                ("CALLBACK__AUTH_ENABLED", "true"),
            ]),
        )
        .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.path, "/hooks/push");
        assert!(!config.auth_enabled);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let args = Args {
            config: Some(PathBuf::from("does/not/exist.toml")),
            ..Args::default()
        };
        assert!(load_with_env(&args, env(&[])).is_err());
    }
}
