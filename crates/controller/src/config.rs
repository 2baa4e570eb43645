//! Controller configuration
//!
//! Read from an optional file named by `CONTROLLER_CONFIG`, overlaid with
//! `CONTROLLER_*` environment variables (nested keys separated by `__`).

use anyhow::{ensure, Context, Result};
use controller_lib::{sim::SimulationConfig, ControllerKind, ManagerConfig};
use serde::Deserialize;
use std::collections::HashSet;

/// Daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Applications under control, one control loop each
    #[serde(default = "default_apps")]
    pub apps: Vec<AppConfig>,
}

/// One controlled application
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub name: String,

    /// Response-time target in seconds
    #[serde(default = "default_response_time_target")]
    pub response_time_target: f64,

    #[serde(default)]
    pub manager: ManagerConfig,

    #[serde(default)]
    pub controller: ControllerKind,

    /// Plant the loop drives
    #[serde(default)]
    pub simulation: SimulationConfig,

    /// Upper bound of the random delay before the first control interval
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

fn default_api_port() -> u16 {
    8080
}

fn default_response_time_target() -> f64 {
    0.35
}

fn default_jitter_ms() -> u64 {
    1000
}

fn default_apps() -> Vec<AppConfig> {
    vec![AppConfig {
        name: "default".to_string(),
        response_time_target: default_response_time_target(),
        manager: ManagerConfig::default(),
        controller: ControllerKind::default(),
        simulation: SimulationConfig::default(),
        jitter_ms: default_jitter_ms(),
    }]
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            apps: default_apps(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from the optional config file and the environment
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var("CONTROLLER_CONFIG") {
            builder = builder.add_source(config::File::with_name(&path));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("CONTROLLER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?;

        let config: Self = config
            .try_deserialize()
            .context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.apps.is_empty(), "At least one application must be configured");
        let mut names = HashSet::new();
        for app in &self.apps {
            ensure!(
                names.insert(app.name.as_str()),
                "Duplicate application name {}",
                app.name
            );
            ensure!(
                app.response_time_target.is_finite() && app.response_time_target > 0.0,
                "Response-time target of {} must be positive",
                app.name
            );
            app.manager
                .validate()
                .with_context(|| format!("Invalid manager configuration for {}", app.name))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.apps.len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_app_list() {
        let config: ControllerConfig = serde_json::from_str(
            r#"{
                "api_port": 9100,
                "apps": [
                    {"name": "rubis", "controller": {"kind": "lq"}},
                    {"name": "olio", "response_time_target": 0.5,
                     "manager": {"warmup_threshold": 2},
                     "controller": {"kind": "mpc", "prediction_horizon": 10, "control_horizon": 2}}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(config.api_port, 9100);
        assert_eq!(config.apps[0].response_time_target, 0.35);
        assert!(matches!(config.apps[0].controller, ControllerKind::Lq(_)));
        assert_eq!(config.apps[1].manager.warmup_threshold, 2);
        assert!(config.apps[1].controller.build().is_ok());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut config = ControllerConfig::default();
        config.apps.push(config.apps[0].clone());
        assert!(config.validate().is_err());
    }
}
