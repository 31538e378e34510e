use anyhow::Context;
use hook_signature::Secret;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use system_utils::path::expand_tilde;
use system_utils::process::CommandSpec;

use crate::cli::Args;

const DEFAULT_ADDRESS: &str = "0.0.0.0:8000";
const DEFAULT_TMP_DIR: &str = "/tmp";
const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct FileConfig {
    pub(crate) address: Option<String>,
    pub(crate) secret_file: Option<PathBuf>,
    pub(crate) tmp_dir: Option<PathBuf>,
    pub(crate) working_dir: Option<PathBuf>,
    pub(crate) timeout_in_secs: Option<u64>,
    pub(crate) no_secret: Option<bool>,
    pub(crate) log_dir: Option<PathBuf>,
    pub(crate) command: Option<Vec<String>>,
}

pub(crate) fn load_file_config(path: &Path) -> anyhow::Result<FileConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: FileConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    Ok(config)
}

pub(crate) fn log_dir(args: &Args, file: &FileConfig) -> Option<PathBuf> {
    args.log_dir
        .as_ref()
        .or(file.log_dir.as_ref())
        .map(|dir| expand_tilde(dir))
}

/// Everything the server needs, resolved and validated once before serving.
#[derive(Debug)]
pub(crate) struct RunnerConfig {
    pub(crate) address: String,
    pub(crate) secret: Option<Secret>,
    pub(crate) no_secret: bool,
    pub(crate) capture_dir: PathBuf,
    pub(crate) command: CommandSpec,
}

impl RunnerConfig {
    /// Command-line values win over the config file, which wins over defaults.
    pub(crate) fn resolve(args: Args, file: FileConfig) -> anyhow::Result<Self> {
        let address = normalize_address(
            args.address
                .or(file.address)
                .unwrap_or_else(|| DEFAULT_ADDRESS.to_string()),
        );

        let no_secret = args.no_secret || file.no_secret.unwrap_or(false);
        let secret_file = args
            .secret_file
            .or(file.secret_file)
            .map(|path| expand_tilde(&path));
        if secret_file.is_some() && no_secret {
            anyhow::bail!("--no-secret and --secret-file are incompatible");
        }
        let secret = secret_file
            .as_deref()
            .map(Secret::from_file)
            .transpose()?;

        let capture_dir = expand_tilde(
            &args
                .tmp_dir
                .or(file.tmp_dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TMP_DIR)),
        );
        if !capture_dir.is_dir() {
            anyhow::bail!("tmp dir {} is not a directory", capture_dir.display());
        }

        let working_dir = args
            .working_dir
            .or(file.working_dir)
            .map(|path| expand_tilde(&path));
        if let Some(dir) = working_dir.as_deref() {
            if !dir.is_dir() {
                anyhow::bail!("working dir {} is not a directory", dir.display());
            }
        }

        let timeout_secs = args
            .timeout_in_secs
            .or(file.timeout_in_secs)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        if timeout_secs == 0 {
            anyhow::bail!("timeout must be at least one second");
        }

        let argv = if args.command.is_empty() {
            file.command.unwrap_or_default()
        } else {
            args.command
        };
        let command =
            CommandSpec::from_argv(&argv, working_dir, Duration::from_secs(timeout_secs))
                .context("no command given to run on hook")?;

        Ok(Self {
            address,
            secret,
            no_secret,
            capture_dir,
            command,
        })
    }

    pub(crate) fn auth_mode(&self) -> &'static str {
        match (self.secret.is_some(), self.no_secret) {
            (true, _) => "secret",
            (false, true) => "no-secret, signatures tolerated",
            (false, false) => "no-secret",
        }
    }
}

/// Accepts the `:port` shorthand for listening on every interface.
fn normalize_address(address: String) -> String {
    if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    fn parse(argv: &[&str]) -> Args {
        let mut full = vec!["hook-runner"];
        full.extend_from_slice(argv);
        Args::try_parse_from(full).expect("parse args")
    }

    #[test]
    fn defaults_apply_without_file() {
        let config = RunnerConfig::resolve(parse(&["/bin/true"]), FileConfig::default())
            .expect("resolve");
        assert_eq!(config.address, "0.0.0.0:8000");
        assert_eq!(config.capture_dir, PathBuf::from("/tmp"));
        assert_eq!(config.command.timeout, Duration::from_secs(60));
        assert_eq!(config.command.program, "/bin/true");
        assert!(config.command.working_dir.is_none());
        assert!(config.secret.is_none());
        assert_eq!(config.auth_mode(), "no-secret");
    }

    #[test]
    fn cli_overrides_file() {
        let file: FileConfig = toml::from_str(
            r#"
address = "127.0.0.1:9000"
timeout_in_secs = 5
command = ["/usr/bin/env", "deploy"]
"#,
        )
        .expect("toml");
        let config = RunnerConfig::resolve(parse(&["--address", ":7000"]), file)
            .expect("resolve");
        assert_eq!(config.address, "0.0.0.0:7000");
        assert_eq!(config.command.timeout, Duration::from_secs(5));
        assert_eq!(config.command.program, "/usr/bin/env");
        assert_eq!(config.command.args, vec!["deploy".to_string()]);
    }

    #[test]
    fn cli_command_replaces_file_command() {
        let file = FileConfig {
            command: Some(vec!["/usr/bin/env".to_string()]),
            ..FileConfig::default()
        };
        let config = RunnerConfig::resolve(parse(&["/bin/echo", "hi"]), file).expect("resolve");
        assert_eq!(config.command.program, "/bin/echo");
        assert_eq!(config.command.args, vec!["hi".to_string()]);
    }

    #[test]
    fn missing_command_is_rejected() {
        let err = RunnerConfig::resolve(parse(&[]), FileConfig::default()).expect_err("no command");
        assert!(err.to_string().contains("no command"));
    }

    #[test]
    fn no_secret_from_file_conflicts_with_secret_file() {
        let mut secret = tempfile::NamedTempFile::new().expect("temp file");
        secret.write_all(b"s3cr3t").expect("write");
        let file = FileConfig {
            no_secret: Some(true),
            ..FileConfig::default()
        };
        let path = secret.path().display().to_string();
        let err = RunnerConfig::resolve(parse(&["--secret-file", &path, "/bin/true"]), file)
            .expect_err("conflict");
        assert!(err.to_string().contains("incompatible"));
    }

    #[test]
    fn secret_file_is_loaded() {
        let mut secret = tempfile::NamedTempFile::new().expect("temp file");
        secret.write_all(b"s3cr3t").expect("write");
        let path = secret.path().display().to_string();
        let config = RunnerConfig::resolve(
            parse(&["--secret-file", &path, "/bin/true"]),
            FileConfig::default(),
        )
        .expect("resolve");
        assert!(config.secret.is_some());
        assert_eq!(config.auth_mode(), "secret");
        assert!(!format!("{config:?}").contains("s3cr3t"));
    }

    #[test]
    fn blank_secret_file_is_a_startup_error() {
        let mut secret = tempfile::NamedTempFile::new().expect("temp file");
        secret.write_all(b"\n").expect("write");
        let path = secret.path().display().to_string();
        let result = RunnerConfig::resolve(
            parse(&["--secret-file", &path, "/bin/true"]),
            FileConfig::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let result = RunnerConfig::resolve(
            parse(&["--timeout-in-secs", "0", "/bin/true"]),
            FileConfig::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn missing_directories_are_rejected() {
        let dir = tempfile::tempdir().expect("temp dir");
        let missing = dir.path().join("missing").display().to_string();
        assert!(RunnerConfig::resolve(
            parse(&["--tmp-dir", &missing, "/bin/true"]),
            FileConfig::default()
        )
        .is_err());
        assert!(RunnerConfig::resolve(
            parse(&["--working-dir", &missing, "/bin/true"]),
            FileConfig::default()
        )
        .is_err());
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(b"adress = \"127.0.0.1:1\"\n").expect("write");
        assert!(load_file_config(file.path()).is_err());
    }

    #[test]
    fn example_config_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../config/hook-runner.example.toml");
        let file = load_file_config(&path).expect("example config");
        assert_eq!(file.address.as_deref(), Some(":8000"));
        assert_eq!(file.timeout_in_secs, Some(60));
        assert_eq!(
            file.command,
            Some(vec!["/usr/local/bin/deploy".to_string(), "--from-hook".to_string()])
        );
    }

    #[test]
    fn normalize_address_expands_port_shorthand() {
        assert_eq!(normalize_address(":8000".to_string()), "0.0.0.0:8000");
        assert_eq!(normalize_address("127.0.0.1:1".to_string()), "127.0.0.1:1");
    }
}
