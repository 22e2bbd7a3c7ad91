use anyhow::Context;
use serde::Deserialize;
use std::{
    collections::HashMap,
    env,
    fs::File,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::constants::{default_priorities, DEFAULT_MAX_WORKERS};
use crate::core::Capability;
use crate::engine::OrchestratorConfig;
use crate::jobs::PollPolicy;
use crate::providers::Endpoints;
use crate::quota::QuotaConfig;
use crate::retry::RetryPolicy;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RetryCfg {
    pub attempts: Option<u32>,
    pub base_delay: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PollingCfg {
    pub initial: Option<String>,
    pub step: Option<String>,
    pub max: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Root {
    pub workers: Option<usize>,
    pub output_dir: Option<PathBuf>,
    pub persistence: Option<PathBuf>,
    pub retry: Option<RetryCfg>,
    pub polling: Option<PollingCfg>,
    #[serde(default)]
    pub timeouts: HashMap<Capability, String>,
    #[serde(default)]
    pub priority: HashMap<Capability, Vec<String>>,
    #[serde(default)]
    pub rate_limits: HashMap<String, u32>,
    pub endpoints: Option<Endpoints>,
}

/// Resolved, immutable application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub source: Option<PathBuf>,
    pub workers: usize,
    pub output_dir: PathBuf,
    pub persistence: Option<PathBuf>,
    pub retry: RetryPolicy,
    pub poll: PollPolicy,
    pub timeouts: HashMap<Capability, Duration>,
    pub priorities: HashMap<Capability, Vec<String>>,
    pub rate_limits: HashMap<String, u32>,
    pub endpoints: Endpoints,
}

impl AppConfig {
    /// Explicit path, else `studio.yaml`/`studio.yml` in the working
    /// directory, else `<config dir>/studio-relay/config.yaml`, else defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let source = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::discover(),
        };
        let root = match &source {
            Some(p) => Self::read_yaml(p)?,
            None => Root::default(),
        };
        Self::from_root(root, source, |name| env::var(name).ok())
    }

    fn discover() -> Option<PathBuf> {
        for candidate in ["studio.yaml", "studio.yml"] {
            let path = Path::new(candidate);
            if path.exists() {
                return Some(path.to_path_buf());
            }
        }
        dirs::config_dir()
            .map(|dir| dir.join("studio-relay").join("config.yaml"))
            .filter(|path| path.exists())
    }

    fn read_yaml(path: &Path) -> anyhow::Result<Root> {
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        serde_yaml::from_reader(file).with_context(|| format!("parsing {}", path.display()))
    }

    fn from_root(
        root: Root,
        source: Option<PathBuf>,
        env_var: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let workers = match env_var("STUDIO_WORKERS") {
            Some(value) => value
                .trim()
                .parse::<usize>()
                .with_context(|| format!("STUDIO_WORKERS must be a number, got '{value}'"))?,
            None => root.workers.unwrap_or(DEFAULT_MAX_WORKERS),
        }
        .max(1);

        let output_dir = env_var("STUDIO_OUTPUT_DIR")
            .map(PathBuf::from)
            .or(root.output_dir)
            .unwrap_or_else(|| PathBuf::from("output"));

        let retry_cfg = root.retry.unwrap_or_default();
        let defaults = RetryPolicy::default();
        let retry = RetryPolicy::new(
            retry_cfg.attempts.unwrap_or(defaults.max_attempts),
            parse_duration("retry.base_delay", retry_cfg.base_delay.as_deref())?
                .unwrap_or(defaults.base_delay),
        );

        let polling = root.polling.unwrap_or_default();
        let defaults = PollPolicy::default();
        let poll = PollPolicy {
            initial: parse_duration("polling.initial", polling.initial.as_deref())?
                .unwrap_or(defaults.initial),
            step: parse_duration("polling.step", polling.step.as_deref())?
                .unwrap_or(defaults.step),
            max: parse_duration("polling.max", polling.max.as_deref())?.unwrap_or(defaults.max),
        };

        let mut timeouts = HashMap::new();
        for (capability, value) in &root.timeouts {
            let label = format!("timeouts.{capability}");
            if let Some(duration) = parse_duration(&label, Some(value))? {
                timeouts.insert(*capability, duration);
            }
        }

        let mut priorities = default_priorities();
        priorities.extend(root.priority);

        Ok(Self {
            source,
            workers,
            output_dir,
            persistence: root.persistence,
            retry,
            poll,
            timeouts,
            priorities,
            rate_limits: root.rate_limits,
            endpoints: root.endpoints.unwrap_or_default(),
        })
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            retry: self.retry,
            poll: self.poll,
            timeouts: self.timeouts.clone(),
            quota: QuotaConfig::new(self.rate_limits.clone()),
        }
    }
}

fn parse_duration(field: &str, value: Option<&str>) -> anyhow::Result<Option<Duration>> {
    value
        .map(|raw| {
            humantime::parse_duration(raw.trim())
                .with_context(|| format!("{field}: invalid duration '{raw}'"))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
workers: 4
persistence: history/generations.jsonl
retry:
  attempts: 5
  base_delay: 500ms
polling:
  initial: 5s
  max: 1m
timeouts:
  video: 10m
priority:
  video: [runway, luma]
rate_limits:
  luma: 20
endpoints:
  openai_base_url: http://localhost:8080/v1
  openai_model: local-model
"#;

    #[test]
    fn loads_yaml_and_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = AppConfig::load(Some(file.path())).unwrap();

        assert_eq!(config.retry, RetryPolicy::new(5, Duration::from_millis(500)));
        assert_eq!(config.poll.initial, Duration::from_secs(5));
        assert_eq!(config.poll.step, PollPolicy::default().step);
        assert_eq!(config.poll.max, Duration::from_secs(60));
        assert_eq!(config.priorities[&Capability::Video], vec!["runway", "luma"]);
        assert_eq!(config.priorities[&Capability::Text][0], "openrouter");
        assert_eq!(config.endpoints.openai_model, "local-model");
        assert_eq!(config.endpoints.luma_base, Endpoints::default().luma_base);

        let orchestrator = config.orchestrator();
        assert_eq!(orchestrator.job_timeout(Capability::Video), Duration::from_secs(600));
        assert_eq!(orchestrator.job_timeout(Capability::Image), Duration::from_secs(120));
        assert_eq!(orchestrator.quota.request_limits["luma"], 20);
    }

    #[test]
    fn environment_overrides_win() {
        let root: Root = serde_yaml::from_str(SAMPLE).unwrap();
        let env = |name: &str| match name {
            "STUDIO_WORKERS" => Some("8".to_string()),
            "STUDIO_OUTPUT_DIR" => Some("/tmp/assets".to_string()),
            _ => None,
        };
        let config = AppConfig::from_root(root, None, env).unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.output_dir, PathBuf::from("/tmp/assets"));
    }

    #[test]
    fn bad_values_are_reported() {
        let root: Root = serde_yaml::from_str("retry:\n  base_delay: soon\n").unwrap();
        let err = AppConfig::from_root(root, None, |_| None).unwrap_err();
        assert!(err.to_string().contains("retry.base_delay"));

        let err = AppConfig::from_root(Root::default(), None, |name| {
            (name == "STUDIO_WORKERS").then(|| "many".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("STUDIO_WORKERS"));
    }
}
