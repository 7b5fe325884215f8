use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::sandbox::Dependency;

#[derive(Parser, Debug)]
#[command(name = "buildbox", version = "0.1", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<String>,

    /// Source file to build and test
    #[arg(long = "source", short = 's')]
    pub source_path: PathBuf,

    /// Project name, used as the workspace directory prefix
    #[arg(long = "name", short = 'n')]
    pub name: Option<String>,

    /// Extra dependency as `name=version`, may be repeated
    #[arg(long = "dep", value_parser = parse_dependency)]
    pub dependencies: Vec<Dependency>,

    /// Directory under which workspaces are created
    #[arg(long = "temp-root")]
    pub temp_root: Option<PathBuf>,
}

impl CliArgs {
    /// Load the configuration from the specified file, if any
    pub fn to_config(&self) -> std::io::Result<Config> {
        let mut config: Config = match &self.config_path {
            Some(path) => {
                let file = std::fs::File::open(path)?;
                let reader = std::io::BufReader::new(file);
                serde_json::from_reader(reader)?
            }
            None => Config::default(),
        };

        if let Some(root) = &self.temp_root {
            config.workspace.temp_root = Some(root.clone());
        }

        Ok(config)
    }
}

fn parse_dependency(raw: &str) -> Result<Dependency, String> {
    match raw.split_once('=') {
        Some((name, version)) if !name.trim().is_empty() && !version.trim().is_empty() => {
            Ok(Dependency::new(name.trim(), version.trim()))
        }
        _ => Err(format!("expected `name=version`, got `{raw}`")),
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub toolchain: ToolchainConfig,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct WorkspaceConfig {
    /// Defaults to `buildbox` under the OS temp directory
    pub temp_root: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ToolchainConfig {
    #[serde(default = "default_grace_period")]
    pub grace_period: MilliSecond,
    #[serde(default = "CommandConfig::default_build")]
    pub build: CommandConfig,
    #[serde(default = "CommandConfig::default_test")]
    pub test: CommandConfig,
    /// Runs after the tests pass; a missing binary is tolerated
    #[serde(default)]
    pub optimize: Option<CommandConfig>,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            grace_period: default_grace_period(),
            build: CommandConfig::default_build(),
            test: CommandConfig::default_test(),
            optimize: None,
        }
    }
}

/// An argument vector plus its limits. `%ROOT%`, `%SOURCE%` and `%MANIFEST%`
/// are substituted per argument.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CommandConfig {
    pub command: Vec<String>,
    #[serde(default = "default_timeout")]
    pub timeout: MilliSecond,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl CommandConfig {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            timeout: default_timeout(),
            env: HashMap::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: MilliSecond) -> Self {
        self.timeout = timeout;
        self
    }

    fn default_build() -> Self {
        Self::new([
            "cargo",
            "build",
            "--target",
            "wasm32-unknown-unknown",
            "--release",
        ])
    }

    fn default_test() -> Self {
        Self::new(["cargo", "test"])
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MilliSecond(pub u64);

impl From<MilliSecond> for Duration {
    fn from(ms: MilliSecond) -> Self {
        Duration::from_millis(ms.0)
    }
}

fn default_timeout() -> MilliSecond {
    MilliSecond(30_000)
}

fn default_grace_period() -> MilliSecond {
    MilliSecond(5_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_deserialization() {
        let file = std::fs::File::open("data/example.json").unwrap();
        let reader = std::io::BufReader::new(file);
        let config: Config = serde_json::from_reader(reader).unwrap();
        assert_eq!(
            config.workspace.temp_root,
            Some(PathBuf::from("/tmp/buildbox"))
        );
        assert_eq!(config.toolchain.grace_period, MilliSecond(2000));
        assert_eq!(config.toolchain.build.timeout, MilliSecond(60000));
        assert_eq!(config.toolchain.test.command, vec!["cargo", "test", "--release"]);
        assert_eq!(config.toolchain.test.timeout, MilliSecond(30000));
        assert_eq!(
            config.toolchain.build.env.get("CARGO_TERM_COLOR"),
            Some(&"never".to_string())
        );
        let optimize = config.toolchain.optimize.unwrap();
        assert_eq!(optimize.command[0], "wasm-opt");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.workspace.temp_root, None);
        assert_eq!(config.toolchain.grace_period, MilliSecond(5000));
        assert_eq!(config.toolchain.build, CommandConfig::default_build());
        assert_eq!(config.toolchain.test.command, vec!["cargo", "test"]);
        assert!(config.toolchain.optimize.is_none());
    }

    #[test]
    fn test_parse_dependency() {
        assert_eq!(
            parse_dependency("serde=1.0").unwrap(),
            Dependency::new("serde", "1.0")
        );
        assert!(parse_dependency("serde").is_err());
        assert!(parse_dependency("=1.0").is_err());
    }

    #[test]
    fn test_cli_overrides_temp_root() {
        let cli = CliArgs::parse_from([
            "buildbox",
            "--source",
            "lib.rs",
            "--temp-root",
            "/var/tmp/bb",
            "--dep",
            "serde=1",
            "--dep",
            "hex=0.4",
        ]);
        assert_eq!(cli.dependencies.len(), 2);

        let config = cli.to_config().unwrap();
        assert_eq!(
            config.workspace.temp_root,
            Some(PathBuf::from("/var/tmp/bb"))
        );
    }
}
