use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use serde::Deserialize;

/// Service configuration, read from YAML at startup.
///
/// Every key is optional. Relative paths resolve against `base-dir`, which is
/// also the working directory of every external sync step.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Configuration {
    pub base_dir: PathBuf,
    pub config_dir: PathBuf,
    pub content_dir: PathBuf,
    pub scripts_dir: PathBuf,
    pub interpreter: InterpreterConfig,
    pub steps: StepScripts,
    pub http: ListenConfig,
    pub notifications: ListenConfig,
    /// Deepest directory level below `content-dir` whose changes are broadcast.
    pub watch_depth: usize,
    #[serde(with = "humantime_serde")]
    pub setup_sync_interval: Duration,
    pub restart_command: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct InterpreterConfig {
    /// Preferred interpreter, usually a virtualenv inside `base-dir`.
    pub project_local: PathBuf,
    /// Used when `project-local` does not exist.
    pub fallback: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct StepScripts {
    pub full_sync: PathBuf,
    pub setup_sync: PathBuf,
    pub register_device: PathBuf,
    pub mark_deleted: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ListenConfig {
    pub bind_address: IpAddr,
    pub port: u16,
}

impl ListenConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }
}

impl Configuration {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        serde_yaml::from_str(&s)
            .with_context(|| format!("failed to parse config at {}", path.display()))
    }

    /// Validate runtime invariants that cannot be expressed via serde defaults alone.
    pub fn validated(self) -> Result<Self> {
        ensure!(
            !self.setup_sync_interval.is_zero(),
            "setup-sync-interval must be greater than zero"
        );
        ensure!(self.watch_depth > 0, "watch-depth must be at least 1");
        ensure!(
            !self.restart_command.is_empty() && !self.restart_command[0].trim().is_empty(),
            "restart-command must name a program"
        );
        ensure!(
            self.http.socket_addr() != self.notifications.socket_addr(),
            "http and notifications must listen on different addresses"
        );
        Ok(self)
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn config_dir(&self) -> PathBuf {
        self.resolve(&self.config_dir)
    }

    pub fn content_dir(&self) -> PathBuf {
        self.resolve(&self.content_dir)
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.resolve(&self.scripts_dir)
    }

    pub fn script_path(&self, script: &Path) -> PathBuf {
        if script.is_absolute() {
            script.to_path_buf()
        } else {
            self.scripts_dir().join(script)
        }
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/opt/kiosk-sync"),
            config_dir: PathBuf::from("config"),
            content_dir: PathBuf::from("downloads"),
            scripts_dir: PathBuf::from("scripts"),
            interpreter: InterpreterConfig::default(),
            steps: StepScripts::default(),
            http: ListenConfig {
                bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                port: 3000,
            },
            notifications: ListenConfig {
                bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                port: 8081,
            },
            watch_depth: 3,
            setup_sync_interval: Duration::from_secs(5 * 60),
            restart_command: vec![
                "sudo".to_string(),
                "/bin/systemctl".to_string(),
                "restart".to_string(),
                "kiosk-sync.service".to_string(),
            ],
        }
    }
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            project_local: PathBuf::from(".venv/bin/python3"),
            fallback: PathBuf::from("python3"),
        }
    }
}

impl Default for StepScripts {
    fn default() -> Self {
        Self {
            full_sync: PathBuf::from("get_all.py"),
            setup_sync: PathBuf::from("get_setup.py"),
            register_device: PathBuf::from("register_device.py"),
            mark_deleted: PathBuf::from("mark_to_delete.py"),
        }
    }
}
