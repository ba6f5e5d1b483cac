use std::{env, fmt, path::PathBuf, str::FromStr, time::Duration};

use url::Url;

use crate::auth::rest_provider::{DEFAULT_REFRESH_BUFFER_MS, RestIdentityConfig};
use crate::auth::token::DEFAULT_EXPIRY_MARGIN_MS;
use crate::types::TenantId;

pub const DEFAULT_API_URL: &str = "http://localhost:8080/api";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SUPERADMIN_VERIFY_PATH: &str = "/superadmin/verify";
pub const DEFAULT_IDENTITY_URL: &str = "https://identitytoolkit.googleapis.com";
pub const DEFAULT_SECURETOKEN_URL: &str = "https://securetoken.googleapis.com";

/// Lifetime of identity toolkit id tokens. The expiry margin must be shorter.
pub const ID_TOKEN_LIFETIME_MS: i64 = 3_600_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidUrl { name: &'static str, value: String, reason: String },
    InvalidValue { name: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidUrl { name, value, reason } => {
                write!(f, "{} is not a valid http(s) URL ({}): {}", name, value, reason)
            }
            ConfigError::InvalidValue { name, value } => {
                write!(f, "Invalid value for {}: {}", name, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Runtime settings for the console client.
#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    /// Base URL of the tenant REST API.
    pub api_url: String,
    /// Tenant used when neither the caller nor the profile names one.
    pub default_tenant: Option<TenantId>,
    pub expiry_margin_ms: i64,
    pub request_timeout_secs: u64,
    /// Super-admin verification endpoint, relative to `api_url`.
    pub superadmin_verify_path: String,
    pub identity_url: String,
    pub securetoken_url: String,
    pub identity_api_key: Option<String>,
    pub session_file: PathBuf,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }
}

impl ConsoleConfig {
    /// Build a config from `lookup`, falling back to the built-in defaults
    /// for unset or unparsable values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            api_url: lookup("HR_CONSOLE_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            default_tenant: lookup("HR_CONSOLE_DEFAULT_TENANT")
                .filter(|t| !t.trim().is_empty())
                .map(TenantId::new),
            expiry_margin_ms: parse_number(lookup("HR_CONSOLE_EXPIRY_MARGIN_MS"))
                .unwrap_or(DEFAULT_EXPIRY_MARGIN_MS),
            request_timeout_secs: parse_number(lookup("HR_CONSOLE_REQUEST_TIMEOUT_SECS"))
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            superadmin_verify_path: lookup("HR_CONSOLE_SUPERADMIN_VERIFY_PATH")
                .unwrap_or_else(|| DEFAULT_SUPERADMIN_VERIFY_PATH.to_string()),
            identity_url: lookup("HR_CONSOLE_IDENTITY_URL")
                .unwrap_or_else(|| DEFAULT_IDENTITY_URL.to_string()),
            securetoken_url: lookup("HR_CONSOLE_SECURETOKEN_URL")
                .unwrap_or_else(|| DEFAULT_SECURETOKEN_URL.to_string()),
            identity_api_key: lookup("HR_CONSOLE_IDENTITY_API_KEY").filter(|k| !k.is_empty()),
            session_file: resolve_session_path(&lookup),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_url("HR_CONSOLE_API_URL", &self.api_url)?;
        check_url("HR_CONSOLE_IDENTITY_URL", &self.identity_url)?;
        check_url("HR_CONSOLE_SECURETOKEN_URL", &self.securetoken_url)?;

        if self.expiry_margin_ms < 0 || self.expiry_margin_ms >= ID_TOKEN_LIFETIME_MS {
            return Err(ConfigError::InvalidValue {
                name: "HR_CONSOLE_EXPIRY_MARGIN_MS",
                value: self.expiry_margin_ms.to_string(),
            });
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                name: "HR_CONSOLE_REQUEST_TIMEOUT_SECS",
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn superadmin_verify_url(&self) -> String {
        format!(
            "{}/{}",
            self.api_url.trim_end_matches('/'),
            self.superadmin_verify_path.trim_start_matches('/')
        )
    }

    pub fn identity_config(&self) -> RestIdentityConfig {
        RestIdentityConfig {
            identity_url: self.identity_url.clone(),
            securetoken_url: self.securetoken_url.clone(),
            api_key: self.identity_api_key.clone(),
            refresh_buffer_ms: DEFAULT_REFRESH_BUFFER_MS,
        }
    }
}

/// Where the session file lives: `HR_CONSOLE_SESSION_FILE`, else under
/// `$XDG_CONFIG_HOME`, else `./.hr-console/`.
pub fn resolve_session_path(lookup: impl Fn(&str) -> Option<String>) -> PathBuf {
    if let Some(p) = lookup("HR_CONSOLE_SESSION_FILE").filter(|p| !p.is_empty()) {
        return PathBuf::from(p);
    }

    if let Some(xdg) = lookup("XDG_CONFIG_HOME").filter(|p| !p.is_empty()) {
        return PathBuf::from(xdg).join("hr-console").join("session.json");
    }

    PathBuf::from(".hr-console").join("session.json")
}

fn parse_number<T: FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|v| v.trim().parse().ok())
}

fn check_url(name: &'static str, value: &str) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidUrl {
        name,
        value: value.to_string(),
        reason,
    };

    let url = Url::parse(value).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(invalid(format!("unsupported scheme `{}`", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn config_from(vars: &[(&str, &str)]) -> ConsoleConfig {
        let vars: BTreeMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ConsoleConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]);
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.default_tenant, None);
        assert_eq!(config.expiry_margin_ms, 5_000);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(
            config.superadmin_verify_url(),
            "http://localhost:8080/api/superadmin/verify"
        );
        assert_eq!(config.session_file, PathBuf::from(".hr-console/session.json"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("HR_CONSOLE_API_URL", "https://hr.example/api/"),
            ("HR_CONSOLE_DEFAULT_TENANT", "acme"),
            ("HR_CONSOLE_EXPIRY_MARGIN_MS", "10000"),
            ("HR_CONSOLE_SUPERADMIN_VERIFY_PATH", "admin/check"),
            ("HR_CONSOLE_IDENTITY_API_KEY", "key-1"),
        ]);

        assert_eq!(config.default_tenant, Some(TenantId::new("acme")));
        assert_eq!(config.superadmin_verify_url(), "https://hr.example/api/admin/check");

        let identity = config.identity_config();
        assert_eq!(identity.refresh_buffer_ms, DEFAULT_REFRESH_BUFFER_MS);
        assert_eq!(identity.api_key.as_deref(), Some("key-1"));
    }

    #[test]
    fn test_unparsable_numbers_fall_back() {
        let config = config_from(&[
            ("HR_CONSOLE_EXPIRY_MARGIN_MS", "soon"),
            ("HR_CONSOLE_REQUEST_TIMEOUT_SECS", ""),
        ]);
        assert_eq!(config.expiry_margin_ms, DEFAULT_EXPIRY_MARGIN_MS);
        assert_eq!(config.request_timeout_secs, DEFAULT_REQUEST_TIMEOUT_SECS);
    }

    #[test]
    fn test_validate_rejects_bad_urls() {
        let config = config_from(&[("HR_CONSOLE_API_URL", "not a url")]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidUrl { name: "HR_CONSOLE_API_URL", .. })
        ));

        let config = config_from(&[("HR_CONSOLE_IDENTITY_URL", "ftp://idp.example")]);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidUrl { .. })));
    }

    #[test]
    fn test_validate_rejects_negative_margin() {
        let config = config_from(&[("HR_CONSOLE_EXPIRY_MARGIN_MS", "-1")]);
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                name: "HR_CONSOLE_EXPIRY_MARGIN_MS",
                value: "-1".into()
            })
        );
    }

    #[test]
    fn test_validate_rejects_margin_beyond_token_lifetime() {
        let config = config_from(&[("HR_CONSOLE_EXPIRY_MARGIN_MS", "7200000")]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { name: "HR_CONSOLE_EXPIRY_MARGIN_MS", .. })
        ));

        let config = config_from(&[("HR_CONSOLE_EXPIRY_MARGIN_MS", "3600000")]);
        assert!(config.validate().is_err());

        let config = config_from(&[("HR_CONSOLE_EXPIRY_MARGIN_MS", "3599999")]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_session_path_resolution() {
        let explicit = resolve_session_path(|name| {
            (name == "HR_CONSOLE_SESSION_FILE").then(|| "/tmp/s.json".to_string())
        });
        assert_eq!(explicit, PathBuf::from("/tmp/s.json"));

        let xdg = resolve_session_path(|name| {
            (name == "XDG_CONFIG_HOME").then(|| "/home/hr/.config".to_string())
        });
        assert_eq!(xdg, PathBuf::from("/home/hr/.config/hr-console/session.json"));
    }
}
