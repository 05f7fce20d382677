use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Session parameters for one notification client.
///
/// Every submitted request works on a snapshot of the value current at
/// `send_request` time, so replacing it never affects calls already in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub username: String,
    pub password: String,
    pub server_address: String,
    pub service_port: u16,
    pub status_poll_delay_ms: u64,
    pub inter_attempt_delay_sec: u64,
    pub answer_wait_time_sec: u64,
    /// 0 means a single attempt without retries
    pub max_retries: u32,
    pub request_timeout_sec: u64,
    /// Channel technology used when dialing, e.g. `PJSIP` or `SIP`
    pub technology: String,
    /// Stasis application that plays custom media
    pub ari_application: String,
    pub archive_path: Option<PathBuf>,
    /// Settled targets kept in memory for status lookups; fixed per client
    pub settled_retention: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            username: String::new(),
            password: String::new(),
            server_address: "127.0.0.1".to_string(),
            service_port: 8088,
            status_poll_delay_ms: 1000,
            inter_attempt_delay_sec: 5,
            answer_wait_time_sec: 30,
            max_retries: 3,
            request_timeout_sec: 15,
            technology: "PJSIP".to_string(),
            ari_application: "voice-notify".to_string(),
            archive_path: None,
            settled_retention: 1024,
        }
    }
}

impl Config {
    /// Load a TOML file; missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn with_server_address(mut self, address: impl Into<String>) -> Self {
        self.server_address = address.into();
        self
    }

    pub fn with_service_port(mut self, port: u16) -> Self {
        self.service_port = port;
        self
    }

    pub fn with_status_poll_delay_ms(mut self, delay_ms: u64) -> Self {
        self.status_poll_delay_ms = delay_ms;
        self
    }

    pub fn with_inter_attempt_delay_sec(mut self, delay_sec: u64) -> Self {
        self.inter_attempt_delay_sec = delay_sec;
        self
    }

    pub fn with_answer_wait_time_sec(mut self, wait_sec: u64) -> Self {
        self.answer_wait_time_sec = wait_sec;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_request_timeout_sec(mut self, timeout_sec: u64) -> Self {
        self.request_timeout_sec = timeout_sec;
        self
    }

    pub fn with_technology(mut self, technology: impl Into<String>) -> Self {
        self.technology = technology.into();
        self
    }

    pub fn with_ari_application(mut self, application: impl Into<String>) -> Self {
        self.ari_application = application.into();
        self
    }

    pub fn with_archive_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.archive_path = Some(path.into());
        self
    }

    pub fn with_settled_retention(mut self, retention: usize) -> Self {
        self.settled_retention = retention;
        self
    }

    pub fn status_poll_delay(&self) -> Duration {
        Duration::from_millis(self.status_poll_delay_ms)
    }

    pub fn inter_attempt_delay(&self) -> Duration {
        Duration::from_secs(self.inter_attempt_delay_sec)
    }

    pub fn answer_wait_time(&self) -> Duration {
        Duration::from_secs(self.answer_wait_time_sec)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_sec)
    }

    /// Base URL of the ARI REST endpoint
    pub fn base_url(&self) -> String {
        format!("http://{}:{}/ari", self.server_address, self.service_port)
    }
}

/// Announcement selected on the command line
#[derive(Debug, Subcommand, Clone)]
pub enum Commands {
    /// Play a recording that lives in the server dial plan
    Predefined {
        #[arg(long)]
        context: String,
        #[arg(long)]
        extension: String,
        #[command(flatten)]
        campaign: CampaignArgs,
    },
    /// Play a media file by path
    Custom {
        #[arg(long)]
        media: PathBuf,
        #[command(flatten)]
        campaign: CampaignArgs,
    },
}

#[derive(Debug, Args, Clone)]
pub struct CampaignArgs {
    /// Phone number to call; repeat for several targets
    #[arg(long = "phone", required = true)]
    pub phones: Vec<String>,

    #[arg(long)]
    pub request_id: Option<String>,
}

/// CLI is input, not the final configuration
#[derive(Debug, Parser, Clone)]
#[command(name = "voice-notify", version)]
pub struct Cli {
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub username: Option<String>,

    #[arg(long)]
    pub password: Option<String>,

    #[arg(long)]
    pub server_address: Option<String>,

    #[arg(long)]
    pub service_port: Option<u16>,

    #[arg(long)]
    pub status_poll_delay_ms: Option<u64>,

    #[arg(long)]
    pub inter_attempt_delay_sec: Option<u64>,

    #[arg(long)]
    pub answer_wait_time_sec: Option<u64>,

    #[arg(long)]
    pub max_retries: Option<u32>,

    #[arg(long)]
    pub archive_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn into_config(self) -> Result<Config> {
        let mut cfg = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        if let Some(user) = self.username {
            cfg.username = user;
        }
        if let Some(password) = self.password {
            cfg.password = password;
        }
        if let Some(addr) = self.server_address {
            cfg.server_address = addr;
        }
        if let Some(port) = self.service_port {
            cfg.service_port = port;
        }
        if let Some(delay) = self.status_poll_delay_ms {
            cfg.status_poll_delay_ms = delay;
        }
        if let Some(delay) = self.inter_attempt_delay_sec {
            cfg.inter_attempt_delay_sec = delay;
        }
        if let Some(wait) = self.answer_wait_time_sec {
            cfg.answer_wait_time_sec = wait;
        }
        if let Some(retries) = self.max_retries {
            cfg.max_retries = retries;
        }
        if let Some(path) = self.archive_path {
            cfg.archive_path = Some(path);
        }

        Ok(cfg)
    }
}
