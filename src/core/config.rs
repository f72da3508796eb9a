use crate::core::errors::{EngineError, Result};
use crate::extension::RegisteredExtension;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

pub const PARALLEL_ENABLED_PROPERTY: &str = "arbor.execution.parallel.enabled";
pub const PARALLELISM_PROPERTY: &str = "arbor.execution.parallel.parallelism";
pub const DEFAULT_EXECUTION_MODE_PROPERTY: &str = "arbor.execution.parallel.mode.default";
pub const DEFAULT_CLASSES_EXECUTION_MODE_PROPERTY: &str = "arbor.execution.parallel.mode.classes.default";
pub const RANDOM_SEED_PROPERTY: &str = "arbor.execution.order.random.seed";
pub const PROPAGATE_FAILURES_PROPERTY: &str = "arbor.execution.failures.propagate";

const ALL_PROPERTIES: [&str; 6] = [
    PARALLEL_ENABLED_PROPERTY,
    PARALLELISM_PROPERTY,
    DEFAULT_EXECUTION_MODE_PROPERTY,
    DEFAULT_CLASSES_EXECUTION_MODE_PROPERTY,
    RANDOM_SEED_PROPERTY,
    PROPAGATE_FAILURES_PROPERTY,
];

/// How a node's children are executed relative to each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Children run one after another on the parent's task
    SameThread,
    /// Children may run on different workers at the same time
    Concurrent,
}

impl FromStr for ExecutionMode {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "same_thread" => Ok(Self::SameThread),
            "concurrent" => Ok(Self::Concurrent),
            other => Err(EngineError::configuration(format!(
                "unknown execution mode '{}'",
                other
            ))),
        }
    }
}

/// Engine configuration, passed once at engine construction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Whether children may run concurrently at all
    pub parallel_enabled: bool,
    /// Maximum number of lifecycle callbacks running at the same time
    pub parallelism: usize,
    /// Execution mode for children of every container without an explicit mode
    pub default_execution_mode: ExecutionMode,
    /// Execution mode for the top-level nodes below the engine root
    pub default_classes_execution_mode: ExecutionMode,
    /// Mark ancestors as failed when one of their descendants failed
    pub propagate_descendant_failures: bool,
    /// Seed used by the random child orderer
    pub random_seed: Option<u64>,
    /// Extensions registered in the root registry, in this order
    #[serde(skip)]
    pub default_extensions: Vec<RegisteredExtension>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            parallel_enabled: false,
            parallelism: cpu_count.max(1),
            default_execution_mode: ExecutionMode::SameThread,
            default_classes_execution_mode: ExecutionMode::SameThread,
            propagate_descendant_failures: true,
            random_seed: None,
            default_extensions: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Create a new builder for EngineConfig
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(EngineError::configuration_field(
                "parallelism must be greater than 0",
                "parallelism",
            ));
        }
        if !self.parallel_enabled
            && (self.default_execution_mode == ExecutionMode::Concurrent
                || self.default_classes_execution_mode == ExecutionMode::Concurrent)
        {
            tracing::warn!("Concurrent execution mode configured but parallel execution is disabled");
        }
        Ok(())
    }

    /// Everything on one worker, in declaration order
    pub fn sequential() -> Self {
        Self::default()
    }

    /// Concurrent execution of containers and tests with the given worker count
    pub fn concurrent(parallelism: usize) -> Self {
        Self {
            parallel_enabled: true,
            parallelism,
            default_execution_mode: ExecutionMode::Concurrent,
            default_classes_execution_mode: ExecutionMode::Concurrent,
            ..Default::default()
        }
    }

    /// Build a configuration from string configuration parameters.
    ///
    /// Unknown keys are ignored; known keys with malformed values are errors.
    pub fn from_parameters(parameters: &HashMap<String, String>) -> Result<Self> {
        let mut config = Self::default();
        let mut classes_mode_set = false;

        if let Some(value) = parameters.get(PARALLEL_ENABLED_PROPERTY) {
            config.parallel_enabled = parse_bool(PARALLEL_ENABLED_PROPERTY, value)?;
        }
        if let Some(value) = parameters.get(PARALLELISM_PROPERTY) {
            config.parallelism = value.trim().parse().map_err(|_| {
                EngineError::configuration_field(
                    format!("invalid parallelism '{}'", value),
                    PARALLELISM_PROPERTY,
                )
            })?;
        }
        if let Some(value) = parameters.get(DEFAULT_EXECUTION_MODE_PROPERTY) {
            config.default_execution_mode = value.parse()?;
        }
        if let Some(value) = parameters.get(DEFAULT_CLASSES_EXECUTION_MODE_PROPERTY) {
            config.default_classes_execution_mode = value.parse()?;
            classes_mode_set = true;
        }
        if !classes_mode_set {
            config.default_classes_execution_mode = config.default_execution_mode;
        }
        if let Some(value) = parameters.get(RANDOM_SEED_PROPERTY) {
            match value.trim().parse::<u64>() {
                Ok(seed) => config.random_seed = Some(seed),
                Err(_) => tracing::warn!(
                    "Failed to convert configuration parameter [{}] with value [{}] to a seed, using a random seed",
                    RANDOM_SEED_PROPERTY,
                    value
                ),
            }
        }
        if let Some(value) = parameters.get(PROPAGATE_FAILURES_PROPERTY) {
            config.propagate_descendant_failures = parse_bool(PROPAGATE_FAILURES_PROPERTY, value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Read the configuration parameters from `ARBOR_*` environment variables
    pub fn from_env() -> Result<Self> {
        let parameters = ALL_PROPERTIES
            .iter()
            .filter_map(|key| {
                let var = key.replace('.', "_").to_ascii_uppercase();
                std::env::var(var).ok().map(|value| (key.to_string(), value))
            })
            .collect();
        Self::from_parameters(&parameters)
    }

    /// Parse the serializable part of the configuration from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(EngineError::configuration_field(
            format!("expected 'true' or 'false' but was '{}'", value),
            key,
        )),
    }
}

/// Builder for EngineConfig
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    /// Enable or disable concurrent execution
    pub fn parallel(mut self, enabled: bool) -> Self {
        self.config.parallel_enabled = enabled;
        self
    }

    /// Set the number of workers
    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.config.parallelism = parallelism;
        self
    }

    /// Set the default execution mode for containers and their top-level nodes
    pub fn execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.config.default_execution_mode = mode;
        self.config.default_classes_execution_mode = mode;
        self
    }

    /// Set the execution mode for the top-level nodes only
    pub fn classes_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.config.default_classes_execution_mode = mode;
        self
    }

    pub fn propagate_descendant_failures(mut self, propagate: bool) -> Self {
        self.config.propagate_descendant_failures = propagate;
        self
    }

    pub fn random_seed(mut self, seed: u64) -> Self {
        self.config.random_seed = Some(seed);
        self
    }

    /// Append a default extension; registration order is preserved
    pub fn default_extension(mut self, extension: RegisteredExtension) -> Self {
        self.config.default_extensions.push(extension);
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
