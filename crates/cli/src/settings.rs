// CLI settings
// Layered: defaults < TOML file < CONVEYOR__* environment < command-line flags

use anyhow::{Context, Result};
use config::{builder::DefaultState, Config, ConfigBuilder, Environment, File};
use conveyor_core::application::{BrokerOptions, HolderOptions, TopologyConfig, TopologyKind};
use conveyor_infra_amqp::AmqpOptions;
use directories::ProjectDirs;
use serde::Deserialize;
use std::path::PathBuf;

const ENV_PREFIX: &str = "CONVEYOR";
const ENV_SEPARATOR: &str = "__";
const CONFIG_FILE_NAME: &str = "conveyor.toml";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub amqp: AmqpOptions,
    pub broker: BrokerOptions,
    pub holder: HolderOptions,
    pub topology: TopologyConfig,
    pub topology_kind: TopologyKind,
}

/// `~/.config/conveyor/conveyor.toml` (or the platform equivalent)
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "conveyor").map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

/// Load settings. An explicit `path` must exist; the default file is optional.
pub fn load(path: Option<&str>) -> Result<Settings> {
    let builder = match path {
        Some(path) => {
            let path = PathBuf::from(shellexpand::tilde(path).into_owned());
            Config::builder().add_source(File::from(path.as_path()).required(true))
        }
        None => match default_config_path() {
            Some(path) => Config::builder().add_source(File::from(path.as_path()).required(false)),
            None => Config::builder(),
        },
    };
    resolve(builder.add_source(environment()))
        .with_context(|| format!("Failed to load settings ({})", describe(path)))
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_SEPARATOR)
        .separator(ENV_SEPARATOR)
        .try_parsing(true)
}

fn resolve(builder: ConfigBuilder<DefaultState>) -> Result<Settings> {
    let settings: Settings = builder.build()?.try_deserialize()?;
    settings.broker.validate()?;
    Ok(settings)
}

fn describe(path: Option<&str>) -> String {
    match path {
        Some(path) => path.to_string(),
        None => default_config_path()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "defaults".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;
    use conveyor_core::application::HolderStrategy;

    fn from_toml(toml: &str) -> Result<Settings> {
        resolve(Config::builder().add_source(File::from_str(toml, FileFormat::Toml)))
    }

    #[test]
    fn test_empty_file_yields_defaults() {
        let settings = from_toml("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.broker.default_queue_name, "default");
        assert_eq!(settings.holder.strategy, HolderStrategy::Pooled);
    }

    #[test]
    fn test_nested_sections_override_defaults() {
        let settings = from_toml(
            r#"
            topology_kind = "dlx-routing"

            [amqp]
            url = "amqp://user:pw@rabbit:5672/jobs"

            [holder]
            strategy = "shared"

            [topology]
            max_priority = 10
            max_delay_time_ms = 86400000
            "#,
        )
        .unwrap();

        assert_eq!(settings.amqp.url, "amqp://user:pw@rabbit:5672/jobs");
        assert_eq!(settings.holder.strategy, HolderStrategy::Shared);
        assert_eq!(settings.topology_kind, TopologyKind::DlxRouting);
        assert_eq!(settings.topology.max_priority, Some(10));
        assert_eq!(settings.topology.max_delay_time_ms, Some(86_400_000));
        assert!(settings.topology.durable);
    }

    #[test]
    fn test_invalid_broker_options_are_rejected() {
        let result = from_toml(
            r#"
            [broker]
            confirm_timeout_ms = 0
            "#,
        );
        assert!(result.is_err());
    }
}
