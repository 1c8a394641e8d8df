use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result};

use crate::config::{models::ClientConfig, validation::ClientConfigValidator};

/// Prefix of environment variables that override file settings,
/// e.g. `TETHER__TIMEOUTS__READ_MS=2000`
pub const ENV_PREFIX: &str = "TETHER";

/// Load and validate a client configuration file.
/// Supports multiple formats: YAML, JSON, TOML, etc.
pub async fn load_config(config_path: &str) -> Result<ClientConfig> {
    let config = load_config_sync(config_path)?;
    ClientConfigValidator::validate(&config)
        .with_context(|| format!("Invalid configuration in {config_path}"))?;
    Ok(config)
}

/// Load configuration synchronously, without validation
pub fn load_config_sync(config_path: &str) -> Result<ClientConfig> {
    let config_path = Path::new(config_path);

    // Determine file format based on extension
    let format = match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("ini") => FileFormat::Ini,
        _ => FileFormat::Toml,
    };

    let settings = Config::builder()
        .add_source(File::new(
            config_path
                .to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
            format,
        ))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    let client_config: ClientConfig = settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })?;

    Ok(client_config)
}

/// Load configuration without validation (used for the validate command)
pub async fn load_config_unchecked(config_path: &str) -> Result<ClientConfig> {
    load_config_sync(config_path)
}

/// Render a configuration as TOML, e.g. for `tether init`
pub fn to_toml(config: &ClientConfig) -> Result<String> {
    toml::to_string_pretty(config).wrap_err("Failed to serialize configuration as TOML")
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[tokio::test]
    async fn test_load_toml_config() {
        let toml_content = r#"
user_agent = "fetcher/1.0"

[timeouts]
connect_ms = 2500

[pool]
max_idle_connections = 1
keep_alive_secs = 60

[proxy]
host = "proxy.internal"
port = 3128
"#;

        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        write!(temp_file, "{}", toml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.user_agent, "fetcher/1.0");
        assert_eq!(config.timeouts.connect_ms, 2500);
        assert_eq!(config.timeouts.read_ms, 10_000);
        assert_eq!(config.pool.max_idle_connections, 1);
        assert_eq!(config.proxy.unwrap().port, 3128);
    }

    #[tokio::test]
    async fn test_load_yaml_config() {
        let yaml_content = r#"
redirects:
  follow_redirects: false
retry:
  max_retries: 1
"#;

        let mut temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert!(!config.redirects.follow_redirects);
        assert_eq!(config.retry.max_retries, 1);
        assert!(config.retry.retry_on_connection_failure);
    }

    #[tokio::test]
    async fn test_load_json_config() {
        let json_content = r#"{ "discard": { "discard_on_timeout": false } }"#;

        let mut temp_file = NamedTempFile::with_suffix(".json").unwrap();
        write!(temp_file, "{}", json_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert!(!config.discard.discard_on_timeout);
        assert!(config.discard.honor_connection_close);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        write!(temp_file, "[timeouts]\nread_ms = 0\n").unwrap();
        let path = temp_file.path().to_str().unwrap();

        assert!(load_config(path).await.is_err());
        let unchecked = load_config_unchecked(path).await.unwrap();
        assert_eq!(unchecked.timeouts.read_ms, 0);
    }

    #[tokio::test]
    async fn test_default_config_round_trips_through_toml() {
        let mut config = ClientConfig::default();
        config.proxy = Some(crate::config::models::ProxyConfig {
            host: "proxy.internal".to_string(),
            port: 8080,
        });
        let rendered = to_toml(&config).unwrap();
        assert!(rendered.contains("[timeouts]"));
        assert!(rendered.contains("[proxy]"));

        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        write!(temp_file, "{}", rendered).unwrap();
        let loaded = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_unset_proxy_is_left_out_of_toml() {
        let rendered = to_toml(&ClientConfig::default()).unwrap();
        assert!(!rendered.contains("[proxy]"));
        assert!(rendered.contains("keep_alive_secs = 300"));
    }
}
