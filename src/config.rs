use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use std::{env, fs, path::Path};

use crate::auth::{Credentials, LoginRequest, LoginSettings};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub data_hub: DataHubConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub test: TestConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataHubConfig {
    #[serde(default = "default_resource")]
    pub resource: String,
    pub tenant_id: String,
    pub namespace_id: String,
    pub client_id: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    #[serde(default = "default_redirect_host")]
    pub redirect_host: String,
    /// 0 binds an ephemeral port
    #[serde(default = "default_redirect_port")]
    pub redirect_port: u16,
    #[serde(default = "default_redirect_path")]
    pub redirect_path: String,
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default = "default_callback_timeout")]
    pub callback_timeout_secs: u64,
    #[serde(default = "default_expiry_skew")]
    pub expiry_skew_secs: i64,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
    #[serde(default)]
    pub validate_issuer_name: bool,
    #[serde(default = "default_max_login_attempts")]
    pub max_login_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_csv_path")]
    pub csv_path: String,
    #[serde(default = "default_type_id")]
    pub type_id: String,
    #[serde(default = "default_true")]
    pub create_streams: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

// Defaults
fn default_resource() -> String { "https://uswe.datahub.connect.aveva.com".to_string() }
fn default_api_version() -> String { "v1".to_string() }
fn default_redirect_host() -> String { "http://127.0.0.1".to_string() }
fn default_redirect_port() -> u16 { 54567 }
fn default_redirect_path() -> String { "signin-oidc".to_string() }
fn default_scope() -> String { "openid ocsapi".to_string() }
fn default_callback_timeout() -> u64 { 300 }
fn default_expiry_skew() -> i64 { crate::auth::token_manager::DEFAULT_EXPIRY_SKEW_SECS }
fn default_http_timeout() -> u64 { 30 }
fn default_max_login_attempts() -> u32 { 3 }
fn default_csv_path() -> String { "datafile.csv".to_string() }
fn default_type_id() -> String { "TemperatureReadings".to_string() }
fn default_true() -> bool { true }

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            redirect_host: default_redirect_host(),
            redirect_port: default_redirect_port(),
            redirect_path: default_redirect_path(),
            scope: default_scope(),
            callback_timeout_secs: default_callback_timeout(),
            expiry_skew_secs: default_expiry_skew(),
            http_timeout_secs: default_http_timeout(),
            validate_issuer_name: false,
            max_login_attempts: default_max_login_attempts(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            csv_path: default_csv_path(),
            type_id: default_type_id(),
            create_streams: true,
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let config_path = env::var("CSV2ADH_CONFIG").unwrap_or_else(|_| {
            let home_config = format!(
                "{}/.config/csv2adh/config.toml",
                env::var("HOME").unwrap_or_default()
            );
            let locations = ["./config.toml", "./csv2adh.toml", home_config.as_str()];

            locations
                .iter()
                .find(|path| Path::new(path).exists())
                .map(|path| path.to_string())
                .unwrap_or_else(|| "./config.toml".to_string())
        });

        #[cfg(unix)]
        Self::validate_file_permissions(&config_path)?;

        let config_content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;

        Self::from_toml(&config_content)
            .with_context(|| format!("Failed to load config file: {}", config_path))
    }

    /// Parse TOML after `${VAR}` substitution, then validate
    pub fn from_toml(content: &str) -> Result<Self> {
        let content = Self::substitute_env_vars(content);
        let config: Config = toml::from_str(&content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Substitute ${VAR_NAME} with environment variable values
    fn substitute_env_vars(content: &str) -> String {
        let mut result = content.to_string();

        while let Some(start) = result.find("${") {
            if let Some(end) = result[start..].find('}') {
                let var_name = &result[start + 2..start + end];
                let value = env::var(var_name).unwrap_or_default();
                result.replace_range(start..start + end + 1, &value);
            } else {
                break;
            }
        }

        result
    }

    pub fn validate(&self) -> Result<()> {
        let required = [
            ("data_hub.tenant_id", &self.data_hub.tenant_id),
            ("data_hub.namespace_id", &self.data_hub.namespace_id),
            ("data_hub.client_id", &self.data_hub.client_id),
            ("data_hub.resource", &self.data_hub.resource),
            ("oauth.redirect_path", &self.oauth.redirect_path),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                anyhow::bail!("Missing required setting: {}", name);
            }
        }

        if self.oauth.callback_timeout_secs == 0 {
            anyhow::bail!("oauth.callback_timeout_secs must be greater than zero");
        }
        if self.oauth.expiry_skew_secs < 0 {
            anyhow::bail!("oauth.expiry_skew_secs must not be negative");
        }

        Ok(())
    }

    /// Identity provider authority: `<resource>/identity`
    pub fn authority(&self) -> String {
        format!("{}/identity", self.data_hub.resource.trim_end_matches('/'))
    }

    pub fn login_settings(&self) -> LoginSettings {
        LoginSettings {
            authority: self.authority(),
            redirect_host: self.oauth.redirect_host.clone(),
            redirect_port: (self.oauth.redirect_port != 0).then_some(self.oauth.redirect_port),
            redirect_path: self.oauth.redirect_path.clone(),
            callback_timeout: Duration::from_secs(self.oauth.callback_timeout_secs),
            validate_issuer_name: self.oauth.validate_issuer_name,
            request: LoginRequest {
                client_id: self.data_hub.client_id.clone(),
                scope: self.oauth.scope.clone(),
                extra_params: BTreeMap::from([(
                    "acr_values".to_string(),
                    format!("tenant:{}", self.data_hub.tenant_id),
                )]),
            },
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.oauth.http_timeout_secs)
    }

    pub fn expiry_skew(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.oauth.expiry_skew_secs)
    }

    /// Credentials for the headless browser, when both are configured
    pub fn test_credentials(&self) -> Option<Credentials> {
        match (&self.test.username, &self.test.password) {
            (Some(username), Some(password)) if !username.is_empty() => Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }

    /// Validate config file permissions (Unix only)
    #[cfg(unix)]
    fn validate_file_permissions(path: &str) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let path_obj = Path::new(path);

        if !path_obj.exists() {
            tracing::debug!("Config file does not exist yet: {}", path);
            return Ok(());
        }

        let metadata = fs::metadata(path_obj)
            .with_context(|| format!("Failed to read metadata for config file: {}", path))?;
        let mode = metadata.permissions().mode();

        // Test credentials may live in this file
        if mode & 0o044 != 0 {
            tracing::warn!(
                "Config file {} has insecure permissions: {:o} (recommended: chmod 600 {})",
                path,
                mode & 0o777,
                path
            );
        }

        if mode & 0o022 != 0 {
            anyhow::bail!(
                "Config file {} is writable by group or others (mode: {:o}). Run: chmod 600 {}",
                path,
                mode & 0o777,
                path
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [data_hub]
        tenant_id = "tenant-1"
        namespace_id = "ns-1"
        client_id = "client-1"
    "#;

    #[test]
    fn test_env_var_substitution() {
        unsafe { env::set_var("CSV2ADH_TEST_VAR", "test_value") };

        let input = "password = \"${CSV2ADH_TEST_VAR}\"";
        let output = Config::substitute_env_vars(input);

        assert_eq!(output, "password = \"test_value\"");

        unsafe { env::remove_var("CSV2ADH_TEST_VAR") };
    }

    #[test]
    fn test_defaults_are_applied() {
        let config = Config::from_toml(MINIMAL).unwrap();

        assert_eq!(config.data_hub.resource, "https://uswe.datahub.connect.aveva.com");
        assert_eq!(config.authority(), "https://uswe.datahub.connect.aveva.com/identity");
        assert_eq!(config.oauth.redirect_port, 54567);
        assert_eq!(config.oauth.expiry_skew_secs, 5);
        assert_eq!(config.upload.type_id, "TemperatureReadings");
        assert!(config.upload.create_streams);
        assert!(config.test_credentials().is_none());
    }

    #[test]
    fn test_login_settings() {
        let config = Config::from_toml(MINIMAL).unwrap();
        let settings = config.login_settings();

        assert_eq!(settings.redirect_port, Some(54567));
        assert_eq!(settings.callback_timeout, Duration::from_secs(300));
        assert_eq!(settings.request.scope, "openid ocsapi");
        assert_eq!(settings.request.extra_params["acr_values"], "tenant:tenant-1");
        assert!(!settings.validate_issuer_name);
    }

    #[test]
    fn test_zero_port_means_ephemeral() {
        let toml = format!("{}\n[oauth]\nredirect_port = 0\n", MINIMAL);
        let config = Config::from_toml(&toml).unwrap();
        assert_eq!(config.login_settings().redirect_port, None);
    }

    #[test]
    fn test_missing_client_id_is_rejected() {
        let toml = r#"
            [data_hub]
            tenant_id = "tenant-1"
            namespace_id = "ns-1"
            client_id = ""
        "#;
        let err = Config::from_toml(toml).unwrap_err();
        assert!(format!("{:#}", err).contains("data_hub.client_id"));
    }

    #[test]
    fn test_test_credentials() {
        let toml = format!("{}\n[test]\nusername = \"alice\"\npassword = \"secret\"\n", MINIMAL);
        let config = Config::from_toml(&toml).unwrap();
        let credentials = config.test_credentials().unwrap();

        assert_eq!(credentials.username, "alice");
        assert_eq!(credentials.password, "secret");
    }
}
