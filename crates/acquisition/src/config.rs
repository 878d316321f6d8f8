//! Acquisition configuration

use serde::{Deserialize, Serialize};

use detector_link::DetectorConfig;
use event_builder::BuilderConfig;
use tof_correlator::CorrelatorConfig;

use crate::pipeline::OutputMode;

/// Top-level configuration, merged from `acquisition.toml` and `DAQ_*`
/// environment variables.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub detector: DetectorConfig,
    pub correlator: CorrelatorConfig,
    pub builder: BuilderConfig,
    /// Transport selected at boot; the output-mode command switches later.
    pub output_mode: OutputMode,
}

impl AcquisitionConfig {
    /// Load from the optional config file, then the environment.
    pub fn load() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name("acquisition").required(false))
            .add_source(config::Environment::with_prefix("DAQ").separator("__"))
            .build()?
            .try_deserialize()
    }
}
