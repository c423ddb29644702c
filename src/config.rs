use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub model: ModelConfig,
    pub facade: FacadeConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Maximum number of canonical entities kept in memory
    pub cache_capacity: usize,
    /// Log the undo/redo stacks after every command
    pub dump_stacks: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacadeConfig {
    /// Subject the in-memory facade acts for
    pub subject: String,
    /// JSON fixture loaded into the in-memory facade; the built-in sample is used when absent
    pub seed_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 10_000,
            dump_stacks: false,
        }
    }
}

impl Default for FacadeConfig {
    fn default() -> Self {
        Self {
            subject: "user:demo".to_string(),
            seed_path: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, an optional `workstation.toml` and the environment
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from("workstation")
    }

    /// Same as [`AppConfig::load`] with an explicit config file stem
    pub fn load_from(file_stem: &str) -> anyhow::Result<Self> {
        let mut config = config::Config::builder();

        config = config.add_source(config::Config::try_from(&AppConfig::default())?);

        config = config.add_source(config::File::with_name(file_stem).required(false));

        // WORKSTATION_MODEL__CACHE_CAPACITY=500 overrides model.cache_capacity
        config = config.add_source(
            config::Environment::with_prefix("WORKSTATION")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = config.build()?;
        let app_config: AppConfig = config.try_deserialize()?;

        Ok(app_config)
    }

    /// Filter string handed to env_logger
    pub fn log_filter(&self) -> &str {
        &self.logging.level
    }
}
