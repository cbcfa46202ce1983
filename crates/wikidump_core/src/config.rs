use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str = "wikidump/0.1";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_CONFIG_FILENAME: &str = "wikidump.toml";

const CLOUD_API_PREFIX: &str = "/wiki/rest/api";
const DC_API_PREFIX: &str = "/rest/api";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct DumpConfig {
    #[serde(default)]
    pub http: HttpSection,
    #[serde(default)]
    pub profiles: BTreeMap<String, Profile>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct HttpSection {
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Cloud,
    Dc,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    BasicApiToken,
    BearerPat,
    None,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Profile {
    pub platform: Platform,
    pub auth: Option<AuthMethod>,
    /// Data Center only: path the instance is mounted under, e.g. `/confluence`.
    pub context_path: Option<String>,
    /// Overrides the REST prefix appended to the base URL and context path.
    pub api_prefix: Option<String>,
}

impl Profile {
    pub fn auth_method(&self) -> AuthMethod {
        self.auth.unwrap_or(match self.platform {
            Platform::Cloud => AuthMethod::BasicApiToken,
            Platform::Dc => AuthMethod::BearerPat,
        })
    }

    /// Root of the REST API for this profile: base URL, DC context path, prefix.
    pub fn api_root(&self, base_url: &str, context_path_override: Option<&str>) -> String {
        let base = base_url.trim().trim_end_matches('/');
        let context = match self.platform {
            Platform::Cloud => String::new(),
            Platform::Dc => {
                normalize_context_path(context_path_override.or(self.context_path.as_deref()))
            }
        };
        let prefix = match (&self.api_prefix, self.platform) {
            (Some(prefix), _) => format!("/{}", prefix.trim().trim_matches('/')),
            (None, Platform::Cloud) => CLOUD_API_PREFIX.to_string(),
            (None, Platform::Dc) => DC_API_PREFIX.to_string(),
        };
        format!("{base}{context}{prefix}")
    }
}

impl DumpConfig {
    /// Resolve a named profile: config file first, then the built-in `cloud`/`dc` profiles.
    pub fn profile(&self, name: &str) -> Result<Profile> {
        if let Some(profile) = self.profiles.get(name) {
            return Ok(profile.clone());
        }
        match builtin_profile(name) {
            Some(profile) => Ok(profile),
            None => {
                let mut known = self.profiles.keys().cloned().collect::<Vec<_>>();
                for builtin in ["cloud", "dc"] {
                    if !known.iter().any(|name| name == builtin) {
                        known.push(builtin.to_string());
                    }
                }
                bail!(
                    "profile '{name}' not found (known profiles: {})",
                    known.join(", ")
                )
            }
        }
    }

    /// Resolve user agent: env WIKIDUMP_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        if let Ok(value) = env::var("WIKIDUMP_USER_AGENT") {
            let trimmed = value.trim().to_string();
            if !trimmed.is_empty() {
                return trimmed;
            }
        }
        self.http
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    /// Resolve HTTP timeout: env WIKIDUMP_HTTP_TIMEOUT_MS > config > DEFAULT_TIMEOUT_MS.
    pub fn timeout_ms(&self) -> u64 {
        env::var("WIKIDUMP_HTTP_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.trim().parse::<u64>().ok())
            .or(self.http.timeout_ms)
            .unwrap_or(DEFAULT_TIMEOUT_MS)
    }
}

/// Load and parse a DumpConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<DumpConfig> {
    if !config_path.exists() {
        return Ok(DumpConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: DumpConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn builtin_profile(name: &str) -> Option<Profile> {
    match name {
        "cloud" => Some(Profile {
            platform: Platform::Cloud,
            auth: Some(AuthMethod::BasicApiToken),
            context_path: None,
            api_prefix: None,
        }),
        "dc" => Some(Profile {
            platform: Platform::Dc,
            auth: Some(AuthMethod::BearerPat),
            context_path: None,
            api_prefix: None,
        }),
        _ => None,
    }
}

fn normalize_context_path(value: Option<&str>) -> String {
    let trimmed = value.unwrap_or("").trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Basic { user: String, token: String },
    Bearer { token: String },
    Anonymous,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic { user, .. } => write!(f, "Basic({user}, <redacted>)"),
            Self::Bearer { .. } => write!(f, "Bearer(<redacted>)"),
            Self::Anonymous => write!(f, "Anonymous"),
        }
    }
}

/// Read credentials for `method` from CONFLUENCE_USER / CONFLUENCE_TOKEN.
pub fn resolve_credentials(method: AuthMethod) -> Result<Credentials> {
    match method {
        AuthMethod::BasicApiToken => {
            let user = required_env("CONFLUENCE_USER");
            let token = required_env("CONFLUENCE_TOKEN");
            match (user, token) {
                (Some(user), Some(token)) => Ok(Credentials::Basic { user, token }),
                _ => bail!("missing CONFLUENCE_USER/CONFLUENCE_TOKEN for basic API token auth"),
            }
        }
        AuthMethod::BearerPat => match required_env("CONFLUENCE_TOKEN") {
            Some(token) => Ok(Credentials::Bearer { token }),
            None => bail!("missing CONFLUENCE_TOKEN for personal access token auth"),
        },
        AuthMethod::None => Ok(Credentials::Anonymous),
    }
}

fn required_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/wikidump.toml")).expect("load config");
        assert!(config.profiles.is_empty());
        assert!(config.http.user_agent.is_none());
    }

    #[test]
    fn load_config_parses_profiles_and_http_section() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("wikidump.toml");
        fs::write(
            &config_path,
            r#"
[http]
user_agent = "test-agent/1.0"
timeout_ms = 5000

[profiles.intranet]
platform = "dc"
auth = "bearer_pat"
context_path = "confluence/"
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(config.http.user_agent.as_deref(), Some("test-agent/1.0"));
        assert_eq!(config.http.timeout_ms, Some(5000));
        let profile = config.profile("intranet").expect("profile");
        assert_eq!(profile.platform, Platform::Dc);
        assert_eq!(profile.auth_method(), AuthMethod::BearerPat);
        assert_eq!(
            profile.api_root("https://wiki.example.org/", None),
            "https://wiki.example.org/confluence/rest/api"
        );
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("wikidump.toml");
        fs::write(&config_path, "[profiles\nplatform = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn builtin_profiles_resolve_without_config_file() {
        let config = DumpConfig::default();
        let cloud = config.profile("cloud").expect("cloud");
        assert_eq!(cloud.auth_method(), AuthMethod::BasicApiToken);
        assert_eq!(
            cloud.api_root("https://acme.atlassian.net", None),
            "https://acme.atlassian.net/wiki/rest/api"
        );
        let dc = config.profile("dc").expect("dc");
        assert_eq!(
            dc.api_root("https://wiki.acme.local", Some("/docs/")),
            "https://wiki.acme.local/docs/rest/api"
        );
    }

    #[test]
    fn unknown_profile_lists_known_names() {
        let error = DumpConfig::default().profile("nope").expect_err("must fail");
        let message = error.to_string();
        assert!(message.contains("nope"));
        assert!(message.contains("cloud"));
        assert!(message.contains("dc"));
    }

    #[test]
    fn api_prefix_override_wins() {
        let profile = Profile {
            platform: Platform::Cloud,
            auth: Some(AuthMethod::None),
            context_path: None,
            api_prefix: Some("/rest/api/".to_string()),
        };
        assert_eq!(
            profile.api_root("https://wiki.example.org", None),
            "https://wiki.example.org/rest/api"
        );
    }

    #[test]
    fn credentials_debug_redacts_tokens() {
        let credentials = Credentials::Basic {
            user: "ada".to_string(),
            token: "secret".to_string(),
        };
        let rendered = format!("{credentials:?}");
        assert!(rendered.contains("ada"));
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn anonymous_auth_needs_no_environment() {
        assert_eq!(
            resolve_credentials(AuthMethod::None).expect("anonymous"),
            Credentials::Anonymous
        );
    }
}
