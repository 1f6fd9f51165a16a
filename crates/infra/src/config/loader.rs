//! Configuration loader
//!
//! Loads a [`ClientConfig`] from a TOML or JSON file and layers environment
//! overrides on top, so credentials can stay out of checked-in files.
//!
//! ## Environment Variables
//! Every variable is namespaced by a caller-chosen prefix, e.g. `BILLING`:
//! - `{PREFIX}_BASE_URL`: replaces `base_url`
//! - `{PREFIX}_TIMEOUT_SECS`: request timeout in (fractional) seconds
//! - `{PREFIX}_CONNECT_TIMEOUT_SECS`: connect timeout in (fractional) seconds
//! - `{PREFIX}_API_KEY`: API key value; selects the `api_key` scheme when no
//!   scheme is configured
//! - `{PREFIX}_BEARER_TOKEN`: bearer token; selects the `bearer` scheme when
//!   no scheme is configured
//! - `{PREFIX}_CLIENT_SECRET`: OAuth2 client secret
//! - `{PREFIX}_LOG_RESPONSE_BODY`: enable response body logging (true/false)

use std::path::Path;
use std::time::Duration;

use conduit_common::{ConfigError, ConfigResult};

use super::{ApiKeyPlacement, AuthConfig, ClientConfig, Secret};

/// Load a client configuration from a file and apply environment overrides
///
/// # Errors
/// Returns `ConfigError` if the file cannot be read or parsed, an override
/// is malformed, or the resulting configuration is invalid.
pub fn load(path: impl AsRef<Path>, env_prefix: &str) -> ConfigResult<ClientConfig> {
    let config = read_config_file(path.as_ref())?;
    let config = apply_env_overrides(config, env_prefix)?;
    config.validate()?;
    Ok(config)
}

/// Load a client configuration from a file
///
/// Format is detected by extension (`.toml` or `.json`).
///
/// # Errors
/// Returns `ConfigError::Load` if the file is missing or malformed, and
/// `ConfigError::Invalid` if it fails validation.
pub fn load_from_file(path: impl AsRef<Path>) -> ConfigResult<ClientConfig> {
    let config = read_config_file(path.as_ref())?;
    config.validate()?;
    Ok(config)
}

/// Parse and validate a TOML configuration
///
/// # Errors
/// Returns `ConfigError` on malformed TOML or an invalid configuration.
pub fn from_toml_str(contents: &str) -> ConfigResult<ClientConfig> {
    let config: ClientConfig = toml::from_str(contents)
        .map_err(|e| ConfigError::Load(format!("Invalid TOML format: {e}")))?;
    config.validate()?;
    Ok(config)
}

/// Parse and validate a JSON configuration
///
/// # Errors
/// Returns `ConfigError` on malformed JSON or an invalid configuration.
pub fn from_json_str(contents: &str) -> ConfigResult<ClientConfig> {
    let config: ClientConfig = serde_json::from_str(contents)
        .map_err(|e| ConfigError::Load(format!("Invalid JSON format: {e}")))?;
    config.validate()?;
    Ok(config)
}

/// Apply `{prefix}_*` environment overrides to `config`
///
/// The result is not validated; callers validate once all layers are applied.
///
/// # Errors
/// Returns `ConfigError::Invalid` if a numeric override does not parse.
pub fn apply_env_overrides(mut config: ClientConfig, prefix: &str) -> ConfigResult<ClientConfig> {
    let key = |suffix: &str| format!("{prefix}_{suffix}");

    if let Some(base_url) = env_var(&key("BASE_URL")) {
        config.base_url = base_url;
    }
    if let Some(timeout) = env_secs(&key("TIMEOUT_SECS"), "timeout")? {
        config.timeout = timeout;
    }
    if let Some(timeout) = env_secs(&key("CONNECT_TIMEOUT_SECS"), "connect_timeout")? {
        config.connect_timeout = timeout;
    }
    config.logging.log_response_body =
        env_bool(&key("LOG_RESPONSE_BODY"), config.logging.log_response_body);

    if let Some(api_key) = env_var(&key("API_KEY")) {
        match &mut config.auth {
            AuthConfig::ApiKey { value, .. } => *value = Secret::new(api_key),
            AuthConfig::None => {
                config.auth = AuthConfig::ApiKey {
                    name: super::default_api_key_name(),
                    value: Secret::new(api_key),
                    placement: ApiKeyPlacement::Header,
                };
            }
            other => {
                tracing::warn!(scheme = other.scheme(), "Ignoring API key override for non api_key scheme");
            }
        }
    }

    if let Some(token) = env_var(&key("BEARER_TOKEN")) {
        match &mut config.auth {
            AuthConfig::Bearer { token: current } => *current = Secret::new(token),
            AuthConfig::None => config.auth = AuthConfig::Bearer { token: Secret::new(token) },
            other => {
                tracing::warn!(scheme = other.scheme(), "Ignoring bearer token override for non bearer scheme");
            }
        }
    }

    if let Some(secret) = env_var(&key("CLIENT_SECRET")) {
        if let AuthConfig::OAuth2(oauth) = &mut config.auth {
            oauth.client_secret = Secret::new(secret);
        } else {
            tracing::warn!(scheme = config.auth.scheme(), "Ignoring client secret override for non oauth2 scheme");
        }
    }

    Ok(config)
}

fn read_config_file(path: &Path) -> ConfigResult<ClientConfig> {
    if !path.exists() {
        return Err(ConfigError::Load(format!("Config file not found: {}", path.display())));
    }

    tracing::info!(path = %path.display(), "Loading client configuration from file");

    let contents = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Load(format!("Failed to read config file: {e}")))?;

    parse_config(&contents, path)
}

fn parse_config(contents: &str, path: &Path) -> ConfigResult<ClientConfig> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match extension {
        "toml" => toml::from_str(contents)
            .map_err(|e| ConfigError::Load(format!("Invalid TOML format: {e}"))),
        "json" => serde_json::from_str(contents)
            .map_err(|e| ConfigError::Load(format!("Invalid JSON format: {e}"))),
        _ => Err(ConfigError::Load(format!("Unsupported config format: {extension}"))),
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn env_secs(key: &str, field: &'static str) -> ConfigResult<Option<Duration>> {
    env_var(key)
        .map(|raw| {
            raw.trim()
                .parse::<f64>()
                .ok()
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                .ok_or_else(|| ConfigError::invalid(field, format!("{key}='{raw}' is not a duration in seconds")))
        })
        .transpose()
}

/// Accepts `1`/`0`, `true`/`false`, `yes`/`no`, `on`/`off` (case-insensitive)
fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map_or(default, |s| matches!(s.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use parking_lot::Mutex;
    use tempfile::NamedTempFile;

    use super::*;
    use crate::config::OAuth2Config;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const TOML_CONFIG: &str = r#"
        name = "billing"
        base_url = "https://billing.example.com/v2"
        timeout = 15.0

        [default_headers]
        Accept = "application/json"

        [auth]
        scheme = "bearer"
        token = "from-file"

        [rate_limit]
        max_requests = 50
        window_seconds = 1.0
        burst_size = 60

        [circuit_breaker]
        failure_threshold = 3
        recovery_timeout_seconds = 20.0

        [retry]
        max_retries = 2
        strategy = "linear"
        initial_delay = 0.5
    "#;

    fn named_file(suffix: &str, contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().expect("temp file");
        file.write_all(contents.as_bytes()).expect("write config");
        file
    }

    #[test]
    fn test_load_from_file_toml() {
        let file = named_file(".toml", TOML_CONFIG);
        let config = load_from_file(file.path()).expect("should load TOML config");

        assert_eq!(config.name, "billing");
        assert_eq!(config.timeout, Duration::from_secs(15));
        assert_eq!(config.connect_timeout, Duration::from_secs(10), "unset fields keep defaults");
        assert_eq!(config.default_headers.get("Accept").map(String::as_str), Some("application/json"));

        let rate_limit = config.rate_limit.expect("rate limit section");
        assert_eq!(rate_limit.capacity(), 60);
        assert!(rate_limit.respect_retry_after);

        let breaker = config.circuit_breaker.expect("breaker section");
        assert_eq!(breaker.failure_threshold, 3);
        assert_eq!(breaker.recovery_timeout, Duration::from_secs(20));
        assert_eq!(breaker.success_threshold, 2);

        let retry = config.retry.expect("retry section");
        assert_eq!(retry.max_retries, 2);
        assert_eq!(retry.initial_delay, Duration::from_millis(500));
        assert!(retry.jitter);
    }

    #[test]
    fn test_load_from_file_json() {
        let json = r#"{
            "name": "crm",
            "base_url": "http://localhost:8080",
            "auth": { "scheme": "basic", "username": "svc", "password": "pw" }
        }"#;
        let file = named_file(".json", json);
        let config = load_from_file(file.path()).expect("should load JSON config");

        assert_eq!(config.name, "crm");
        assert!(matches!(config.auth, AuthConfig::Basic { ref username, .. } if username == "svc"));
        assert!(config.retry.is_none(), "omitted policies stay disabled");
    }

    #[test]
    fn test_load_from_file_errors() {
        let missing = load_from_file("/nonexistent/conduit/client.toml");
        assert!(matches!(missing, Err(ConfigError::Load(_))));

        let yaml = named_file(".yaml", "name: x");
        assert!(matches!(load_from_file(yaml.path()), Err(ConfigError::Load(_))));

        let broken = named_file(".toml", "name = ");
        assert!(matches!(load_from_file(broken.path()), Err(ConfigError::Load(_))));

        let invalid = named_file(".toml", "name = \"x\"\nbase_url = \"not a url\"\n");
        assert!(matches!(load_from_file(invalid.path()), Err(ConfigError::Invalid { field: "base_url", .. })));
    }

    #[test]
    fn test_from_str_validates() {
        assert!(from_toml_str(TOML_CONFIG).is_ok());
        assert!(from_json_str(r#"{"name":"x","base_url":"https://a.example.com","max_connections":0}"#).is_err());
    }

    /// Validates environment overrides on top of a file configuration.
    ///
    /// Assertions:
    /// - Base URL, timeouts and bearer token are replaced.
    /// - Values not overridden are kept.
    #[test]
    fn test_env_overrides_replace_file_values() {
        let _guard = ENV_LOCK.lock();
        let prefix = "CONDUIT_TEST_OVERRIDES";
        std::env::set_var(format!("{prefix}_BASE_URL"), "https://staging.example.com");
        std::env::set_var(format!("{prefix}_TIMEOUT_SECS"), "2.5");
        std::env::set_var(format!("{prefix}_BEARER_TOKEN"), "from-env");
        std::env::set_var(format!("{prefix}_LOG_RESPONSE_BODY"), "yes");

        let file = named_file(".toml", TOML_CONFIG);
        let result = load(file.path(), prefix);

        std::env::remove_var(format!("{prefix}_BASE_URL"));
        std::env::remove_var(format!("{prefix}_TIMEOUT_SECS"));
        std::env::remove_var(format!("{prefix}_BEARER_TOKEN"));
        std::env::remove_var(format!("{prefix}_LOG_RESPONSE_BODY"));

        let config = result.expect("should load with overrides");
        assert_eq!(config.base_url, "https://staging.example.com");
        assert_eq!(config.timeout, Duration::from_millis(2500));
        assert_eq!(config.auth, AuthConfig::Bearer { token: Secret::new("from-env") });
        assert!(config.logging.log_response_body);
        assert_eq!(config.name, "billing");
    }

    #[test]
    fn test_env_api_key_selects_scheme() {
        let _guard = ENV_LOCK.lock();
        let prefix = "CONDUIT_TEST_API_KEY";
        std::env::set_var(format!("{prefix}_API_KEY"), "k-env");

        let result = apply_env_overrides(ClientConfig::new("svc", "https://api.example.com"), prefix);
        std::env::remove_var(format!("{prefix}_API_KEY"));

        let config = result.expect("overrides apply");
        assert_eq!(
            config.auth,
            AuthConfig::ApiKey {
                name: "X-API-Key".to_string(),
                value: Secret::new("k-env"),
                placement: ApiKeyPlacement::Header,
            }
        );
    }

    #[test]
    fn test_env_client_secret_for_oauth2() {
        let _guard = ENV_LOCK.lock();
        let prefix = "CONDUIT_TEST_CLIENT_SECRET";
        std::env::set_var(format!("{prefix}_CLIENT_SECRET"), "rotated");

        let config = ClientConfig::new("svc", "https://api.example.com").with_auth(AuthConfig::OAuth2(
            OAuth2Config::new("id", "old", "https://auth.example.com/token"),
        ));
        let result = apply_env_overrides(config, prefix);
        std::env::remove_var(format!("{prefix}_CLIENT_SECRET"));

        match result.expect("overrides apply").auth {
            AuthConfig::OAuth2(oauth) => assert_eq!(oauth.client_secret.expose(), "rotated"),
            other => panic!("expected oauth2, got {other:?}"),
        }
    }

    #[test]
    fn test_env_invalid_timeout() {
        let _guard = ENV_LOCK.lock();
        let prefix = "CONDUIT_TEST_BAD_TIMEOUT";
        std::env::set_var(format!("{prefix}_TIMEOUT_SECS"), "soon");

        let result = apply_env_overrides(ClientConfig::new("svc", "https://api.example.com"), prefix);
        std::env::remove_var(format!("{prefix}_TIMEOUT_SECS"));

        assert!(matches!(result, Err(ConfigError::Invalid { field: "timeout", .. })));
    }

    #[test]
    fn test_env_bool_parsing() {
        let _guard = ENV_LOCK.lock();
        std::env::set_var("CONDUIT_TEST_BOOL_ON", "ON");
        std::env::set_var("CONDUIT_TEST_BOOL_OFF", "0");

        assert!(env_bool("CONDUIT_TEST_BOOL_ON", false));
        assert!(!env_bool("CONDUIT_TEST_BOOL_OFF", true));
        assert!(env_bool("CONDUIT_TEST_BOOL_MISSING", true));

        std::env::remove_var("CONDUIT_TEST_BOOL_ON");
        std::env::remove_var("CONDUIT_TEST_BOOL_OFF");
    }
}
