use std::{collections::HashMap, env, path::Path};

use config::{builder::DefaultState, Config, ConfigBuilder, ConfigError, Environment, File};
use gpu_quota_data::misc::parsing::Duration;
use gpu_quota_data::report::ReportMode;
use gpu_quota_data::usage::CostTable;
use gpu_quota_data::{DEFAULT_ACCOUNTING_LAG, DEFAULT_COST_PER_GPU_MINUTE, DEFAULT_QOS, DEFAULT_SUPERUSER};
use serde::Deserialize;

const SYSTEM_CONFIG: &str = "/etc/gpu_quota/config.toml";
const ENV_PREFIX: &str = "GPU_QUOTA";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Account allowed to report on any user or account.
    pub superuser: String,
    pub qos: Vec<String>,
    pub accounting_lag: Duration,
    pub mode: ReportMode,
    /// Rate per GPU-minute by partition. Entries are merged with the built-in ones.
    pub cost_per_gpu_minute: CostTable,
}

impl Settings {
    pub fn new(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "default".into());

        let mut builder = defaults()?
            .add_source(File::from(Path::new(SYSTEM_CONFIG)).required(false))
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false));
        if let Some(path) = config_file {
            builder = builder.add_source(File::from(path));
        }

        builder.add_source(environment(None)).build()?.try_deserialize()
    }
}

fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    let mut builder = Config::builder()
        .set_default("superuser", DEFAULT_SUPERUSER)?
        .set_default("qos", DEFAULT_QOS.to_vec())?
        .set_default("accounting_lag", DEFAULT_ACCOUNTING_LAG)?
        .set_default("mode", ReportMode::default().name())?;
    for (partition, rate) in DEFAULT_COST_PER_GPU_MINUTE {
        builder = builder.set_default(format!("cost_per_gpu_minute.{partition}"), rate)?;
    }
    Ok(builder)
}

/// `GPU_QUOTA_*` variables, `GPU_QUOTA_QOS` is a comma separated list. `vars` replaces the process
/// environment.
fn environment(vars: Option<HashMap<String, String>>) -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("qos")
        .source(vars)
}
