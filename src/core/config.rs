use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::core::errors::{AuraError, Result};
use crate::exec::retry::BackoffPolicy;
use crate::router::RouterConfig;

/// Orchestrator configuration with all tuning parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    // Concurrency
    /// Size of the node worker pool shared by every running task
    pub max_workers: usize,
    /// Maximum number of tasks executing at the same time
    pub max_concurrent_tasks: usize,

    // Routing
    pub router: RouterConfig,

    // Node execution
    /// Backoff between node retry attempts
    pub retry: BackoffPolicy,
    /// Capture diagnostics for successful nodes too
    pub capture_on_success: bool,
    /// Upper bound on a single diagnostic capture
    pub capture_timeout_ms: u64,

    // Task lifecycle
    /// Task deadline used when a request does not carry one
    pub default_task_timeout_ms: u64,
    /// Number of events retained per task
    pub task_event_log_capacity: usize,
    /// Re-evaluate the policy gate after a successful run
    pub audit_after_run: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            max_concurrent_tasks: 4,
            router: RouterConfig::default(),
            retry: BackoffPolicy::default(),
            capture_on_success: false,
            capture_timeout_ms: 2_000,
            default_task_timeout_ms: 300_000, // 5 minutes
            task_event_log_capacity: 256,
            audit_after_run: false,
        }
    }
}

impl OrchestratorConfig {
    pub fn builder() -> OrchestratorConfigBuilder {
        OrchestratorConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(AuraError::configuration_field(
                "max_workers must be greater than 0",
                "max_workers",
            ));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(AuraError::configuration_field(
                "max_concurrent_tasks must be greater than 0",
                "max_concurrent_tasks",
            ));
        }
        if self.task_event_log_capacity == 0 {
            return Err(AuraError::configuration_field(
                "task_event_log_capacity must be greater than 0",
                "task_event_log_capacity",
            ));
        }
        if self.default_task_timeout_ms == 0 {
            return Err(AuraError::configuration_field(
                "default_task_timeout_ms must be greater than 0",
                "default_task_timeout_ms",
            ));
        }
        self.router.validate()?;
        self.retry.validate()?;
        Ok(())
    }

    /// Small pools and short delays for local runs and tests
    pub fn development() -> Self {
        Self {
            max_workers: 4,
            max_concurrent_tasks: 2,
            retry: BackoffPolicy {
                base_delay_ms: 5,
                max_delay_ms: 50,
                multiplier: 2.0,
                jitter: false,
            },
            capture_timeout_ms: 500,
            default_task_timeout_ms: 30_000,
            task_event_log_capacity: 128,
            ..Default::default()
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| AuraError::io(format!("read config {}", path.display()), e))?;
        Self::from_yaml_str(&contents)
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }

    pub fn default_task_timeout(&self) -> Duration {
        Duration::from_millis(self.default_task_timeout_ms)
    }
}

/// Builder for OrchestratorConfig
pub struct OrchestratorConfigBuilder {
    config: OrchestratorConfig,
}

impl OrchestratorConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: OrchestratorConfig::default(),
        }
    }

    pub fn max_workers(mut self, workers: usize) -> Self {
        self.config.max_workers = workers;
        self
    }

    pub fn max_concurrent_tasks(mut self, tasks: usize) -> Self {
        self.config.max_concurrent_tasks = tasks;
        self
    }

    pub fn confidence_threshold(mut self, threshold: f64) -> Self {
        self.config.router.confidence_threshold = threshold;
        self
    }

    pub fn tie_epsilon(mut self, epsilon: f64) -> Self {
        self.config.router.tie_epsilon = epsilon;
        self
    }

    pub fn retry(mut self, policy: BackoffPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn capture_on_success(mut self, enabled: bool) -> Self {
        self.config.capture_on_success = enabled;
        self
    }

    pub fn capture_timeout(mut self, timeout: Duration) -> Self {
        self.config.capture_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn default_task_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_task_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn task_event_log_capacity(mut self, capacity: usize) -> Self {
        self.config.task_event_log_capacity = capacity;
        self
    }

    pub fn audit_after_run(mut self, enabled: bool) -> Self {
        self.config.audit_after_run = enabled;
        self
    }

    pub fn build(self) -> Result<OrchestratorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for OrchestratorConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
