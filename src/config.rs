use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use clap::Parser;
use serde::Deserialize;

use crate::job::{ByteSize, Job, ResourceLimits, generate_job_id};

const DEFAULT_IMAGE: &str = "ubautograding/autograding_image_2004";
const DEFAULT_DESTINATION: &str = "/home/autolab/";
const DEFAULT_COMMAND: &str =
    "su autolab -c \"autodriver -u 100 -f 104857600 -t 900 -o 104857600 autolab\"";

#[derive(Parser, Debug, Default)]
#[command(name = "gradebox", version, about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<PathBuf>,

    /// Runtime image to grade in, overrides the configuration file
    #[arg(long, short = 'i')]
    pub image: Option<String>,

    /// Directory holding the submission files
    #[arg(long, short = 'b')]
    pub bundle: Option<PathBuf>,

    /// Wall-clock budget in seconds for the running sandbox
    #[arg(long, short = 't')]
    pub timeout: Option<u64>,

    /// List sandboxes on the backend after the job
    #[arg(long, default_value_t = false)]
    pub list: bool,

    /// Remove stopped sandboxes after the job
    #[arg(long, default_value_t = false)]
    pub prune: bool,

    /// Print the job report as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

impl CliArgs {
    /// Load the configuration file, then apply command line overrides
    pub fn to_config(&self) -> anyhow::Result<Config> {
        let mut config = match self.config_file() {
            Some(path) => Config::load(&path)?,
            None => Config::default(),
        };

        if let Some(image) = &self.image {
            config.job.image = image.clone();
        }
        if let Some(bundle) = &self.bundle {
            config.job.bundle = Some(bundle.clone());
        }
        if let Some(timeout) = self.timeout {
            config.job.limits.timeout_secs = timeout;
        }

        Ok(config)
    }

    /// The explicit `--config` path, or the per-user config file if one exists
    fn config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            return Some(path.clone());
        }

        use directories::ProjectDirs;

        let path = ProjectDirs::from("", "", "gradebox")?
            .config_dir()
            .join("config.json");
        path.exists().then_some(path)
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct Config {
    pub backend: BackendConfig,
    pub sandbox: SandboxConfig,
    pub job: JobConfig,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open config file {}", path.display()))?;
        let reader = std::io::BufReader::new(file);
        let config = serde_json::from_reader(reader)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        log::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct BackendConfig {
    /// `unix://` or `tcp://` address of the daemon, `DOCKER_HOST` when unset
    pub host: Option<String>,
    /// API version such as "1.41", negotiated with the daemon when unset
    pub api_version: Option<String>,
    pub request_timeout_secs: u64,
    /// Grace period given to the sandboxed process on stop
    pub stop_timeout_secs: i64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: None,
            api_version: None,
            request_timeout_secs: 120,
            stop_timeout_secs: 10,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Where the bundle lands inside the sandbox; fixed per image family
    pub destination: String,
    pub remove_volumes: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            destination: DEFAULT_DESTINATION.to_string(),
            remove_volumes: true,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct JobConfig {
    pub id: Option<String>,
    pub image: String,
    pub bundle: Option<PathBuf>,
    pub command: Vec<String>,
    pub limits: LimitsConfig,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            id: None,
            image: DEFAULT_IMAGE.to_string(),
            bundle: None,
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                DEFAULT_COMMAND.to_string(),
            ],
            limits: LimitsConfig::default(),
        }
    }
}

impl JobConfig {
    pub fn to_job(&self) -> anyhow::Result<Job> {
        let bundle = self
            .bundle
            .clone()
            .ok_or_else(|| anyhow!("No submission bundle given (use --bundle or job.bundle)"))?;
        if self.command.is_empty() {
            bail!("The execution command must not be empty");
        }
        if self.limits.timeout_secs == 0 {
            bail!("The job timeout must not be 0");
        }

        Ok(Job {
            id: self.id.clone().unwrap_or_else(generate_job_id),
            image: self.image.clone(),
            bundle,
            limits: self.limits.to_limits(),
            command: self.command.clone(),
        })
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct LimitsConfig {
    /// Bytes
    pub memory: ByteSize,
    pub cpus: f64,
    pub timeout_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            memory: ByteSize(512 * 1_000_000),
            cpus: 2.0,
            timeout_secs: 10,
        }
    }
}

impl LimitsConfig {
    pub fn to_limits(&self) -> ResourceLimits {
        ResourceLimits {
            memory: self.memory,
            cpus: self.cpus,
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}
