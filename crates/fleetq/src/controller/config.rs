use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::error::config_error;
use crate::controller::{MAX_RECEIVE_BATCH, MAX_RECEIVE_WAIT};

/// Configuration of a single controller, loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerConfig {
    /// Name of the controller, used to tag the launched instances.
    #[serde(default = "default_name")]
    pub name: String,
    pub queue: QueueConfig,
    pub template: TemplateConfig,
    #[serde(default)]
    pub scaling: ScalingConfig,
    #[serde(default)]
    pub provisioning: ProvisioningConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub aws: AwsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    /// URL of the request queue.
    pub url: String,
    /// How long should a single receive wait for a message.
    #[serde(default = "default_wait_time_secs")]
    pub wait_time_secs: u64,
    /// Visibility timeout of received messages. Queue default is used when missing.
    #[serde(default)]
    pub visibility_timeout_secs: Option<u64>,
    /// How many messages can be received in a single cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Sleep between two poll cycles.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl QueueConfig {
    pub fn wait_time(&self) -> Duration {
        Duration::from_secs(self.wait_time_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Template used to launch new workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateConfig {
    pub image_id: String,
    #[serde(default = "default_instance_type")]
    pub instance_type: String,
    #[serde(default)]
    pub key_name: Option<String>,
    #[serde(default)]
    pub security_group_ids: Vec<String>,
    #[serde(default)]
    pub subnet_id: Option<String>,
    /// Boot script passed to the instance. Takes precedence over `user_data`.
    #[serde(default)]
    pub user_data_file: Option<PathBuf>,
    #[serde(default)]
    pub user_data: Option<String>,
    /// Prefix of the `Name` tag of launched instances.
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScalingPolicyKind {
    /// Scale directly to the last observed backlog.
    Reactive,
    /// Scale to the moving average of recent backlog samples.
    Smoothed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BacklogSignal {
    /// Number of messages received in the current cycle.
    Received,
    /// Received messages plus the approximate depth of the queue.
    QueueDepth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScalingConfig {
    #[serde(default = "default_max_fleet_size")]
    pub max_fleet_size: u32,
    #[serde(default = "default_policy")]
    pub policy: ScalingPolicyKind,
    /// Number of backlog samples averaged by the smoothed policy.
    #[serde(default = "default_smoothing_window")]
    pub smoothing_window: usize,
    /// Minimum time between two scaling events.
    #[serde(default)]
    pub cooldown_secs: u64,
    #[serde(default = "default_backlog_signal")]
    pub backlog_signal: BacklogSignal,
    /// Rebuild the fleet from tagged instances on startup.
    #[serde(default)]
    pub reconcile: bool,
    /// Release addresses and terminate all workers when the controller stops.
    #[serde(default)]
    pub drain_on_exit: bool,
}

impl ScalingConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            max_fleet_size: default_max_fleet_size(),
            policy: default_policy(),
            smoothing_window: default_smoothing_window(),
            cooldown_secs: 0,
            backlog_signal: default_backlog_signal(),
            reconcile: false,
            drain_on_exit: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvisioningConfig {
    /// How often is the state of launched instances checked.
    #[serde(default = "default_running_poll_interval_ms")]
    pub running_poll_interval_ms: u64,
    /// Maximum time to wait until launched instances are running.
    #[serde(default = "default_running_timeout_secs")]
    pub running_timeout_secs: u64,
    /// Maximum number of state checks of launched instances.
    #[serde(default = "default_max_running_polls")]
    pub max_running_polls: u32,
}

impl ProvisioningConfig {
    pub fn running_poll_interval(&self) -> Duration {
        Duration::from_millis(self.running_poll_interval_ms)
    }

    pub fn running_timeout(&self) -> Duration {
        Duration::from_secs(self.running_timeout_secs)
    }
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            running_poll_interval_ms: default_running_poll_interval_ms(),
            running_timeout_secs: default_running_timeout_secs(),
            max_running_polls: default_max_running_polls(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DispatchConfig {
    #[serde(default = "default_worker_port")]
    pub worker_port: u16,
    #[serde(default = "default_intake_path")]
    pub path: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl DispatchConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_port: default_worker_port(),
            path: default_intake_path(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AwsConfig {
    /// Path to the `aws` command line program.
    #[serde(default = "default_aws_program")]
    pub program: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub profile: Option<String>,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            program: default_aws_program(),
            region: None,
            profile: None,
        }
    }
}

impl ControllerConfig {
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> crate::Result<Self> {
        let config: ControllerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.name.trim().is_empty() {
            return config_error("controller name must not be empty");
        }
        if self.queue.url.trim().is_empty() {
            return config_error("queue.url must not be empty");
        }
        if self.template.image_id.trim().is_empty() {
            return config_error("template.image_id must not be empty");
        }
        if self.scaling.max_fleet_size == 0 {
            return config_error("scaling.max_fleet_size must be at least 1");
        }
        if self.queue.batch_size == 0 || self.queue.batch_size > MAX_RECEIVE_BATCH {
            return config_error(format!(
                "queue.batch_size must be between 1 and {MAX_RECEIVE_BATCH}"
            ));
        }
        if self.queue.wait_time() > MAX_RECEIVE_WAIT {
            return config_error(format!(
                "queue.wait_time_secs must be at most {}",
                MAX_RECEIVE_WAIT.as_secs()
            ));
        }
        if self.scaling.policy == ScalingPolicyKind::Smoothed && self.scaling.smoothing_window == 0
        {
            return config_error("scaling.smoothing_window must be at least 1");
        }
        if self.provisioning.max_running_polls == 0 {
            return config_error("provisioning.max_running_polls must be at least 1");
        }
        if !self.dispatch.path.starts_with('/') {
            return config_error("dispatch.path must start with `/`");
        }
        Ok(())
    }
}

fn default_name() -> String {
    "fleetq".to_string()
}
fn default_wait_time_secs() -> u64 {
    10
}
fn default_batch_size() -> u32 {
    1
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_instance_type() -> String {
    "t2.micro".to_string()
}
fn default_name_prefix() -> String {
    "app-tier-instance".to_string()
}
fn default_max_fleet_size() -> u32 {
    20
}
fn default_policy() -> ScalingPolicyKind {
    ScalingPolicyKind::Reactive
}
fn default_smoothing_window() -> usize {
    5
}
fn default_backlog_signal() -> BacklogSignal {
    BacklogSignal::Received
}
fn default_running_poll_interval_ms() -> u64 {
    5000
}
fn default_running_timeout_secs() -> u64 {
    10 * 60
}
fn default_max_running_polls() -> u32 {
    120
}
fn default_worker_port() -> u16 {
    3000
}
fn default_intake_path() -> String {
    "/process-image".to_string()
}
fn default_request_timeout_secs() -> u64 {
    120
}
fn default_aws_program() -> String {
    "aws".to_string()
}
