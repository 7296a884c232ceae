//! Configuration for the hint pipeline.
//!
//! Two layers:
//! - [`HintConfig`]: process settings read from environment variables
//!   (storage, queue, retry budget, collaborator endpoints).
//! - [`AiConfig`]: model settings read from a YAML file; every field has a
//!   default so a missing file or a partial file is valid.
//!
//! Both are loaded once by the binary and injected into the phase context.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scheduler::connection::ReconnectPolicy;
use crate::scheduler::task::TaskKind;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// The AI model file could not be parsed.
    #[error("Invalid AI model configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// =============================================================================
// Task priorities
// =============================================================================

/// Queue priority per task type, plus the priority used for retries.
///
/// Higher numbers are delivered first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskPriorities {
    pub run_student_program: u8,
    pub generate_enhanced_programs: u8,
    pub run_enhanced_program: u8,
    pub add_reflection: u8,
    pub generate_hint: u8,
    pub deliver_hint: u8,
    pub retry: u8,
}

impl Default for TaskPriorities {
    fn default() -> Self {
        Self {
            run_student_program: 1,
            generate_enhanced_programs: 1,
            run_enhanced_program: 1,
            add_reflection: 2,
            generate_hint: 2,
            deliver_hint: 3,
            retry: 0,
        }
    }
}

impl TaskPriorities {
    /// Returns the configured priority for a fresh task of the given kind.
    pub fn for_kind(&self, kind: TaskKind) -> u8 {
        match kind {
            TaskKind::RunStudentProgram => self.run_student_program,
            TaskKind::GenerateEnhancedPrograms => self.generate_enhanced_programs,
            TaskKind::RunEnhancedProgram => self.run_enhanced_program,
            TaskKind::AddReflection => self.add_reflection,
            TaskKind::GenerateHint => self.generate_hint,
            TaskKind::DeliverHint => self.deliver_hint,
        }
    }

    fn highest(&self) -> u8 {
        [
            self.run_student_program,
            self.generate_enhanced_programs,
            self.run_enhanced_program,
            self.add_reflection,
            self.generate_hint,
            self.deliver_hint,
            self.retry,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
    }
}

// =============================================================================
// Process configuration
// =============================================================================

/// Process-level configuration for workers and the CLI.
#[derive(Debug, Clone)]
pub struct HintConfig {
    // Storage and queue
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// Redis connection URL.
    pub redis_url: String,
    /// Prefix of the Redis keys used by the task queue.
    pub queue_name: String,
    /// Highest queue priority level (levels are `0..=max_priority`).
    pub max_priority: u8,
    pub priorities: TaskPriorities,
    /// How long a worker process's in-flight tasks stay claimed after its
    /// last lease renewal.
    pub consumer_lease: Duration,

    // Workers
    /// Number of concurrent workers pulling from the queue.
    pub num_workers: usize,
    /// How long a worker blocks on an empty queue before checking for shutdown.
    pub poll_interval: Duration,
    /// Dequeue failures in a row after which a worker reports the transport lost.
    pub max_consecutive_errors: u32,
    pub shutdown_timeout: Duration,
    pub reconnect_initial_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// `None` retries the queue connection forever.
    pub reconnect_max_attempts: Option<u32>,

    // Task retry budget
    /// Delivery attempts per task, including the first one.
    pub max_tries: u32,
    /// Pause after republishing a failed task.
    pub retry_pause: Duration,

    // Collaborators
    pub execution_url: String,
    pub execution_result_url: String,
    pub execution_poll_interval: Duration,
    pub execution_max_wait: Duration,
    pub problem_query_url: String,
    pub delivery_url: String,
    pub llm_api_base: String,
    pub llm_api_key: Option<String>,
    /// Attempts per LLM call for transient failures.
    pub llm_max_attempts: u32,
    pub llm_retry_delay: Duration,
    pub llm_timeout: Duration,

    /// Optional YAML file with model settings.
    pub ai_config_path: Option<PathBuf>,
}

impl Default for HintConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/hint_forge".to_string(),
            redis_url: "redis://localhost:6379".to_string(),
            queue_name: "hint_tasks".to_string(),
            max_priority: 3,
            priorities: TaskPriorities::default(),
            consumer_lease: Duration::from_secs(60),

            num_workers: 4,
            poll_interval: Duration::from_secs(1),
            max_consecutive_errors: 5,
            shutdown_timeout: Duration::from_secs(60),
            reconnect_initial_delay: Duration::from_secs(3),
            reconnect_max_delay: Duration::from_secs(60),
            reconnect_max_attempts: None,

            max_tries: 3,
            retry_pause: Duration::from_secs(1),

            execution_url: "http://localhost:8001/execute".to_string(),
            execution_result_url: "http://localhost:8001/result".to_string(),
            execution_poll_interval: Duration::from_secs(3),
            execution_max_wait: Duration::from_secs(600),
            problem_query_url: "http://localhost:8002/problem".to_string(),
            delivery_url: "http://localhost:8000/hint".to_string(),
            llm_api_base: "http://localhost:4000".to_string(),
            llm_api_key: None,
            llm_max_attempts: 3,
            llm_retry_delay: Duration::from_secs(2),
            llm_timeout: Duration::from_secs(120),

            ai_config_path: None,
        }
    }
}

impl HintConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DATABASE_URL`: PostgreSQL connection URL (required)
    /// - `REDIS_URL`: Redis connection URL (default: redis://localhost:6379)
    /// - `HINT_QUEUE_NAME`: queue key prefix (default: hint_tasks)
    /// - `QUEUE_MAX_PRIORITY`: highest priority level (default: 3)
    /// - `HINT_CONSUMER_LEASE_SECS`: in-flight claim of a worker process (default: 60)
    /// - `HINT_WORKERS`: number of workers (default: 4)
    /// - `HINT_POLL_INTERVAL_SECS`: empty-queue wait (default: 1)
    /// - `HINT_MAX_CONSECUTIVE_ERRORS`: dequeue failures before reconnect (default: 5)
    /// - `MAX_TRIES`: delivery attempts per task (default: 3)
    /// - `RETRY_PAUSE_MS`: pause after a republish (default: 1000)
    /// - `RUN_STUDENT_PROGRAM_PRIORITY`, `GENERATE_ENHANCED_PROGRAMS_PRIORITY`,
    ///   `RUN_ENHANCED_PROGRAM_PRIORITY`, `ADD_REFLECTION_PRIORITY`,
    ///   `GENERATE_HINT_PRIORITY`, `DELIVER_HINT_PRIORITY`, `RETRY_PRIORITY`
    /// - `RECONNECT_INITIAL_DELAY_SECS`, `RECONNECT_MAX_DELAY_SECS`,
    ///   `RECONNECT_MAX_ATTEMPTS`
    /// - `EXECUTION_URL`, `EXECUTION_RESULT_URL`, `EXECUTION_POLL_INTERVAL_SECS`,
    ///   `EXECUTION_MAX_WAIT_SECS`
    /// - `PROBLEM_QUERY_URL`, `HINT_DELIVERY_URL`
    /// - `LITELLM_API_BASE`, `LITELLM_API_KEY`, `LLM_MAX_ATTEMPTS`,
    ///   `LLM_RETRY_DELAY_MS`, `LLM_TIMEOUT_SECS`
    /// - `AI_CONFIG_PATH`: YAML model settings
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or have invalid values.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.database_url = std::env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))?;

        if let Ok(val) = std::env::var("REDIS_URL") {
            config.redis_url = val;
        }
        if let Ok(val) = std::env::var("HINT_QUEUE_NAME") {
            config.queue_name = val;
        }
        if let Ok(val) = std::env::var("QUEUE_MAX_PRIORITY") {
            config.max_priority = parse_env_value(&val, "QUEUE_MAX_PRIORITY")?;
        }
        if let Ok(val) = std::env::var("HINT_CONSUMER_LEASE_SECS") {
            config.consumer_lease =
                Duration::from_secs(parse_env_value(&val, "HINT_CONSUMER_LEASE_SECS")?);
        }

        // Workers
        if let Ok(val) = std::env::var("HINT_WORKERS") {
            config.num_workers = parse_env_value(&val, "HINT_WORKERS")?;
        }
        if let Ok(val) = std::env::var("HINT_POLL_INTERVAL_SECS") {
            config.poll_interval = Duration::from_secs(parse_env_value(&val, "HINT_POLL_INTERVAL_SECS")?);
        }
        if let Ok(val) = std::env::var("HINT_MAX_CONSECUTIVE_ERRORS") {
            config.max_consecutive_errors = parse_env_value(&val, "HINT_MAX_CONSECUTIVE_ERRORS")?;
        }
        if let Ok(val) = std::env::var("RECONNECT_INITIAL_DELAY_SECS") {
            config.reconnect_initial_delay =
                Duration::from_secs(parse_env_value(&val, "RECONNECT_INITIAL_DELAY_SECS")?);
        }
        if let Ok(val) = std::env::var("RECONNECT_MAX_DELAY_SECS") {
            config.reconnect_max_delay =
                Duration::from_secs(parse_env_value(&val, "RECONNECT_MAX_DELAY_SECS")?);
        }
        if let Ok(val) = std::env::var("RECONNECT_MAX_ATTEMPTS") {
            config.reconnect_max_attempts = Some(parse_env_value(&val, "RECONNECT_MAX_ATTEMPTS")?);
        }

        // Retry budget
        if let Ok(val) = std::env::var("MAX_TRIES") {
            config.max_tries = parse_env_value(&val, "MAX_TRIES")?;
        }
        if let Ok(val) = std::env::var("RETRY_PAUSE_MS") {
            config.retry_pause = Duration::from_millis(parse_env_value(&val, "RETRY_PAUSE_MS")?);
        }

        // Priorities
        let p = &mut config.priorities;
        for (key, slot) in [
            ("RUN_STUDENT_PROGRAM_PRIORITY", &mut p.run_student_program),
            ("GENERATE_ENHANCED_PROGRAMS_PRIORITY", &mut p.generate_enhanced_programs),
            ("RUN_ENHANCED_PROGRAM_PRIORITY", &mut p.run_enhanced_program),
            ("ADD_REFLECTION_PRIORITY", &mut p.add_reflection),
            ("GENERATE_HINT_PRIORITY", &mut p.generate_hint),
            ("DELIVER_HINT_PRIORITY", &mut p.deliver_hint),
            ("RETRY_PRIORITY", &mut p.retry),
        ] {
            if let Ok(val) = std::env::var(key) {
                *slot = parse_env_value(&val, key)?;
            }
        }

        // Collaborators
        if let Ok(val) = std::env::var("EXECUTION_URL") {
            config.execution_url = val;
        }
        if let Ok(val) = std::env::var("EXECUTION_RESULT_URL") {
            config.execution_result_url = val;
        }
        if let Ok(val) = std::env::var("EXECUTION_POLL_INTERVAL_SECS") {
            config.execution_poll_interval =
                Duration::from_secs(parse_env_value(&val, "EXECUTION_POLL_INTERVAL_SECS")?);
        }
        if let Ok(val) = std::env::var("EXECUTION_MAX_WAIT_SECS") {
            config.execution_max_wait =
                Duration::from_secs(parse_env_value(&val, "EXECUTION_MAX_WAIT_SECS")?);
        }
        if let Ok(val) = std::env::var("PROBLEM_QUERY_URL") {
            config.problem_query_url = val;
        }
        if let Ok(val) = std::env::var("HINT_DELIVERY_URL") {
            config.delivery_url = val;
        }
        if let Ok(val) = std::env::var("LITELLM_API_BASE") {
            config.llm_api_base = val;
        }
        config.llm_api_key = std::env::var("LITELLM_API_KEY").ok();
        if let Ok(val) = std::env::var("LLM_MAX_ATTEMPTS") {
            config.llm_max_attempts = parse_env_value(&val, "LLM_MAX_ATTEMPTS")?;
        }
        if let Ok(val) = std::env::var("LLM_RETRY_DELAY_MS") {
            config.llm_retry_delay = Duration::from_millis(parse_env_value(&val, "LLM_RETRY_DELAY_MS")?);
        }
        if let Ok(val) = std::env::var("LLM_TIMEOUT_SECS") {
            config.llm_timeout = Duration::from_secs(parse_env_value(&val, "LLM_TIMEOUT_SECS")?);
        }

        if let Ok(val) = std::env::var("AI_CONFIG_PATH") {
            config.ai_config_path = Some(PathBuf::from(val));
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_url cannot be empty".to_string(),
            ));
        }

        if self.queue_name.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "queue_name cannot be empty".to_string(),
            ));
        }

        if self.consumer_lease < Duration::from_secs(1) {
            return Err(ConfigError::ValidationFailed(
                "consumer_lease must be at least one second".to_string(),
            ));
        }

        if self.num_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "num_workers must be greater than 0".to_string(),
            ));
        }

        if self.max_tries == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_tries must be at least 1".to_string(),
            ));
        }

        if self.max_consecutive_errors == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_consecutive_errors must be greater than 0".to_string(),
            ));
        }

        if self.priorities.highest() > self.max_priority {
            return Err(ConfigError::ValidationFailed(format!(
                "task priorities must not exceed max_priority ({})",
                self.max_priority
            )));
        }

        if self.llm_max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "llm_max_attempts must be at least 1".to_string(),
            ));
        }

        if self.reconnect_initial_delay > self.reconnect_max_delay {
            return Err(ConfigError::ValidationFailed(
                "reconnect_initial_delay cannot exceed reconnect_max_delay".to_string(),
            ));
        }

        Ok(())
    }

    /// Loads the AI model settings from `ai_config_path`, or defaults when unset.
    pub fn load_ai_config(&self) -> Result<AiConfig, ConfigError> {
        match &self.ai_config_path {
            Some(path) => AiConfig::from_file(path),
            None => Ok(AiConfig::default()),
        }
    }

    /// The queue reconnect policy described by this configuration.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: self.reconnect_initial_delay,
            max_delay: self.reconnect_max_delay,
            max_attempts: self.reconnect_max_attempts,
        }
    }

    /// Builder method to set database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    /// Builder method to set Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Builder method to set the queue name.
    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    /// Builder method to set the number of workers.
    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Builder method to set the retry budget.
    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries;
        self
    }

    /// Builder method to set the pause after a republish.
    pub fn with_retry_pause(mut self, pause: Duration) -> Self {
        self.retry_pause = pause;
        self
    }

    /// Builder method to set the task priorities.
    pub fn with_priorities(mut self, priorities: TaskPriorities) -> Self {
        self.priorities = priorities;
        self
    }

    /// Builder method to set the highest priority level.
    pub fn with_max_priority(mut self, max_priority: u8) -> Self {
        self.max_priority = max_priority;
        self
    }

    /// Builder method to set the AI model file path.
    pub fn with_ai_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ai_config_path = Some(path.into());
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

// =============================================================================
// AI model configuration
// =============================================================================

/// Upper bound on the number of variants requested per enhancement call.
pub const MAX_PROGRAMS: u32 = 20;

/// Model used to generate enhanced programs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgramGenerationModel {
    pub name: String,
    pub temperature: f64,
    /// Number of variants requested per call.
    pub n_programs: u32,
}

impl Default for ProgramGenerationModel {
    fn default() -> Self {
        Self {
            name: "gpt-5".to_string(),
            temperature: 0.5,
            n_programs: 5,
        }
    }
}

/// Model used to write the final hint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HintGenerationModel {
    pub name: String,
    pub temperature: f64,
}

impl Default for HintGenerationModel {
    fn default() -> Self {
        Self {
            name: "gpt-5".to_string(),
            temperature: 0.0,
        }
    }
}

/// LLM settings for both generation calls.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub program_generation_model: ProgramGenerationModel,
    pub hint_generation_model: HintGenerationModel,
}

impl AiConfig {
    /// Parses and validates a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: AiConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a YAML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    /// Validates the model settings.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` when a name is empty, a
    /// temperature is outside `[0, 2]` or `n_programs` is outside `[1, 20]`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let program = &self.program_generation_model;
        let hint = &self.hint_generation_model;

        if program.name.is_empty() || hint.name.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "model name cannot be empty".to_string(),
            ));
        }

        if !(0.0..=2.0).contains(&program.temperature) {
            return Err(ConfigError::ValidationFailed(
                "program_generation_model.temperature must be between 0.0 and 2.0".to_string(),
            ));
        }

        if !(0.0..=2.0).contains(&hint.temperature) {
            return Err(ConfigError::ValidationFailed(
                "hint_generation_model.temperature must be between 0.0 and 2.0".to_string(),
            ));
        }

        if program.n_programs == 0 || program.n_programs > MAX_PROGRAMS {
            return Err(ConfigError::ValidationFailed(format!(
                "program_generation_model.n_programs must be between 1 and {}",
                MAX_PROGRAMS
            )));
        }

        Ok(())
    }
}
