use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{DroverError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    pub heartbeat_interval_secs: u64,
    pub staleness_threshold_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            staleness_threshold_secs: 90,
            sweep_interval_secs: 15,
        }
    }
}

impl LivenessConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_secs(self.staleness_threshold_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Program each task is dispatched to. Unset means tasks cannot be
    /// dispatched.
    pub program: Option<String>,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub liveness: LivenessConfig,
    pub executor: ExecutorConfig,
    /// YAML roster; the built-in roster is used when unset.
    pub roster_path: Option<PathBuf>,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    env_var(name)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| DroverError::Config(format!("{}={:?}: {}", name, raw, e)))
        })
        .transpose()
}

impl Config {
    /// Defaults overridden by `DROVER_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// A TOML file overridden by `DROVER_*` environment variables.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DroverError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut config: Config = toml::from_str(&content).map_err(|e| {
            DroverError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(host) = env_var("DROVER_HOST") {
            self.server.host = host;
        }
        if let Some(port) = env_parse("DROVER_PORT")? {
            self.server.port = port;
        }
        if let Some(secs) = env_parse("DROVER_HEARTBEAT_INTERVAL_SECS")? {
            self.liveness.heartbeat_interval_secs = secs;
        }
        if let Some(secs) = env_parse("DROVER_STALENESS_THRESHOLD_SECS")? {
            self.liveness.staleness_threshold_secs = secs;
        }
        if let Some(secs) = env_parse("DROVER_SWEEP_INTERVAL_SECS")? {
            self.liveness.sweep_interval_secs = secs;
        }
        if let Some(program) = env_var("DROVER_EXECUTOR") {
            self.executor.program = Some(program);
        }
        if let Some(args) = env_var("DROVER_EXECUTOR_ARGS") {
            self.executor.args = args.split_whitespace().map(str::to_string).collect();
        }
        if let Some(path) = env_var("DROVER_ROSTER") {
            self.roster_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let liveness = &self.liveness;
        if liveness.heartbeat_interval_secs == 0 || liveness.sweep_interval_secs == 0 {
            return Err(DroverError::Config(
                "heartbeat and sweep intervals must be positive".to_string(),
            ));
        }
        // One late heartbeat must not flip an agent offline.
        if liveness.staleness_threshold_secs < 2 * liveness.heartbeat_interval_secs {
            return Err(DroverError::Config(format!(
                "staleness threshold {}s must be at least twice the heartbeat interval {}s",
                liveness.staleness_threshold_secs, liveness.heartbeat_interval_secs
            )));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::with_env;
    use std::io::Write;

    const CLEAR: [(&str, Option<&str>); 8] = [
        ("DROVER_HOST", None),
        ("DROVER_PORT", None),
        ("DROVER_HEARTBEAT_INTERVAL_SECS", None),
        ("DROVER_STALENESS_THRESHOLD_SECS", None),
        ("DROVER_SWEEP_INTERVAL_SECS", None),
        ("DROVER_EXECUTOR", None),
        ("DROVER_EXECUTOR_ARGS", None),
        ("DROVER_ROSTER", None),
    ];

    #[test]
    fn test_defaults() {
        let config = with_env(&CLEAR, Config::from_env).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.bind_address(), "0.0.0.0:3000");
        assert_eq!(config.liveness.staleness_threshold(), Duration::from_secs(90));
    }

    #[test]
    fn test_env_overrides() {
        let mut vars = CLEAR.to_vec();
        vars.extend([
            ("DROVER_PORT", Some("8088")),
            ("DROVER_EXECUTOR", Some("/usr/local/bin/agent-run")),
            ("DROVER_EXECUTOR_ARGS", Some("--profile prod")),
        ]);

        let config = with_env(&vars, Config::from_env).unwrap();
        assert_eq!(config.server.port, 8088);
        assert_eq!(
            config.executor.program.as_deref(),
            Some("/usr/local/bin/agent-run")
        );
        assert_eq!(config.executor.args, vec!["--profile", "prod"]);
    }

    #[test]
    fn test_bad_env_value() {
        let mut vars = CLEAR.to_vec();
        vars.push(("DROVER_PORT", Some("eighty")));

        let err = with_env(&vars, Config::from_env).unwrap_err();
        assert!(matches!(err, DroverError::Config(msg) if msg.contains("DROVER_PORT")));
    }

    #[test]
    fn test_load_toml_with_env_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
roster_path = "agents.yaml"

[server]
port = 4100

[liveness]
heartbeat_interval_secs = 10
staleness_threshold_secs = 30
"#
        )
        .unwrap();

        let mut vars = CLEAR.to_vec();
        vars.push(("DROVER_HOST", Some("127.0.0.1")));

        let config = with_env(&vars, || Config::load(file.path())).unwrap();
        assert_eq!(config.bind_address(), "127.0.0.1:4100");
        assert_eq!(config.liveness.heartbeat_interval(), Duration::from_secs(10));
        assert_eq!(config.liveness.sweep_interval_secs, 15);
        assert_eq!(config.roster_path, Some(PathBuf::from("agents.yaml")));
    }

    #[test]
    fn test_staleness_must_cover_two_heartbeats() {
        let config = Config {
            liveness: LivenessConfig {
                heartbeat_interval_secs: 30,
                staleness_threshold_secs: 45,
                sweep_interval_secs: 15,
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = with_env(&CLEAR, || Config::load(Path::new("/nonexistent/drover.toml")))
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
