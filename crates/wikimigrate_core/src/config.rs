use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backoff::{
    BackoffPolicy, DEFAULT_COOLDOWN_MS, DEFAULT_INITIAL_DELAY_MS, DEFAULT_MAX_DELAY_MS,
};
use crate::error::ConfigError;
use crate::model::EntityId;

pub const DEFAULT_USER_AGENT: &str = "wikimigrate/0.2";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_CONFIG_RELATIVE_PATH: &str = ".wikimigrate/config.toml";
pub const DEFAULT_SCOPE_BOOK_NAME: &str = "Migrated Content";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct MigrateConfig {
    #[serde(default)]
    pub source: SourceSection,
    #[serde(default)]
    pub destination: DestinationSection,
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub backoff: BackoffSection,
    /// Source account id or email -> destination user id.
    #[serde(default)]
    pub identities: BTreeMap<String, EntityId>,
    #[serde(skip)]
    pub secrets: Secrets,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SourceSection {
    pub host: Option<String>,
    pub email: Option<String>,
    pub space_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct DestinationSection {
    pub host: Option<String>,
    pub token_id: Option<String>,
    pub shelf_name: Option<String>,
    pub shelf_id: Option<EntityId>,
    pub default_owner_id: Option<EntityId>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SyncSection {
    pub skip_existing: Option<bool>,
    pub verify_assignments: Option<bool>,
    pub intro_pages: Option<bool>,
    pub scope_book_name: Option<String>,
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct BackoffSection {
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub cooldown_ms: Option<u64>,
}

/// Credentials that are only ever read from the environment.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secrets {
    pub source_api_token: Option<String>,
    pub destination_token_secret: Option<String>,
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |value: &Option<String>| value.as_ref().map(|_| "<redacted>");
        f.debug_struct("Secrets")
            .field("source_api_token", &redact(&self.source_api_token))
            .field(
                "destination_token_secret",
                &redact(&self.destination_token_secret),
            )
            .finish()
    }
}

/// Everything the source client needs, validated.
#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub host: String,
    pub email: String,
    pub api_token: String,
    pub space_key: String,
    pub user_agent: String,
    pub timeout_ms: u64,
}

/// Everything the destination client needs, validated.
#[derive(Debug, Clone)]
pub struct DestinationSettings {
    pub host: String,
    pub token_id: String,
    pub token_secret: String,
    pub user_agent: String,
    pub timeout_ms: u64,
}

impl MigrateConfig {
    /// Overlay process environment variables.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| env::var(key).ok());
    }

    /// Overlay values from `lookup`; blank values are ignored.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| {
            lookup(key)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
        };

        if let Some(host) = value("CONFLUENCE_HOST") {
            self.source.host = Some(host);
        }
        if let Some(email) = value("CONFLUENCE_EMAIL") {
            self.source.email = Some(email);
        }
        if let Some(space_key) = value("CONFLUENCE_SPACE_KEY") {
            self.source.space_key = Some(space_key);
        }
        if let Some(host) = value("BOOKSTACK_HOST") {
            self.destination.host = Some(host);
        }
        if let Some(token_id) = value("BOOKSTACK_TOKEN_ID") {
            self.destination.token_id = Some(token_id);
        }
        if let Some(shelf) = value("BOOKSTACK_SHELF") {
            self.destination.shelf_name = Some(shelf);
        }
        self.secrets.source_api_token = value("CONFLUENCE_API_TOKEN");
        self.secrets.destination_token_secret = value("BOOKSTACK_TOKEN_SECRET");
    }

    pub fn skip_existing(&self) -> bool {
        self.sync.skip_existing.unwrap_or(true)
    }

    pub fn verify_assignments(&self) -> bool {
        self.sync.verify_assignments.unwrap_or(true)
    }

    pub fn intro_pages(&self) -> bool {
        self.sync.intro_pages.unwrap_or(true)
    }

    pub fn user_agent(&self) -> String {
        self.sync
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn timeout_ms(&self) -> u64 {
        self.sync.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS)
    }

    /// Name of the book that receives nodes without a resolvable book:
    /// config > space key > fixed default.
    pub fn scope_book_name(&self) -> String {
        self.sync
            .scope_book_name
            .clone()
            .or_else(|| self.source.space_key.clone())
            .unwrap_or_else(|| DEFAULT_SCOPE_BOOK_NAME.to_string())
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::from_millis(
            self.backoff
                .initial_delay_ms
                .unwrap_or(DEFAULT_INITIAL_DELAY_MS),
            self.backoff.max_delay_ms.unwrap_or(DEFAULT_MAX_DELAY_MS),
            self.backoff.cooldown_ms.unwrap_or(DEFAULT_COOLDOWN_MS),
        )
    }

    pub fn validate_source(&self) -> Result<SourceSettings, ConfigError> {
        let host = required(&self.source.host, "source.host", "CONFLUENCE_HOST")?;
        Ok(SourceSettings {
            host: normalize_host(&host, "source.host")?,
            email: required(&self.source.email, "source.email", "CONFLUENCE_EMAIL")?,
            api_token: required(
                &self.secrets.source_api_token,
                "source api token",
                "CONFLUENCE_API_TOKEN",
            )?,
            space_key: required(
                &self.source.space_key,
                "source.space_key",
                "CONFLUENCE_SPACE_KEY",
            )?,
            user_agent: self.user_agent(),
            timeout_ms: self.timeout_ms(),
        })
    }

    pub fn validate_destination(&self) -> Result<DestinationSettings, ConfigError> {
        let host = required(&self.destination.host, "destination.host", "BOOKSTACK_HOST")?;
        let initial = self.backoff.initial_delay_ms.unwrap_or(DEFAULT_INITIAL_DELAY_MS);
        let max = self.backoff.max_delay_ms.unwrap_or(DEFAULT_MAX_DELAY_MS);
        if max < initial {
            return Err(ConfigError::Invalid {
                setting: "backoff.max_delay_ms",
                detail: format!("{max} is below initial_delay_ms {initial}"),
            });
        }
        Ok(DestinationSettings {
            host: normalize_host(&host, "destination.host")?,
            token_id: required(
                &self.destination.token_id,
                "destination.token_id",
                "BOOKSTACK_TOKEN_ID",
            )?,
            token_secret: required(
                &self.secrets.destination_token_secret,
                "destination token secret",
                "BOOKSTACK_TOKEN_SECRET",
            )?,
            user_agent: self.user_agent(),
            timeout_ms: self.timeout_ms(),
        })
    }
}

fn required(
    value: &Option<String>,
    setting: &'static str,
    env: &'static str,
) -> Result<String, ConfigError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or(ConfigError::Missing { setting, env })
}

/// Accept bare hostnames (`example.atlassian.net`) as well as full URLs.
fn normalize_host(raw: &str, setting: &'static str) -> Result<String, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    let parsed = reqwest::Url::parse(&candidate).map_err(|error| ConfigError::Invalid {
        setting,
        detail: format!("{raw}: {error}"),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ConfigError::Invalid {
            setting,
            detail: format!("unsupported scheme in {raw}"),
        });
    }
    Ok(candidate)
}

/// `explicit` wins; otherwise `.wikimigrate/config.toml` under `root`.
pub fn resolve_config_path(explicit: Option<&Path>, root: &Path) -> PathBuf {
    match explicit {
        Some(path) if path.is_absolute() => path.to_path_buf(),
        Some(path) => root.join(path),
        None => root.join(DEFAULT_CONFIG_RELATIVE_PATH),
    }
}

/// Load and parse a MigrateConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<MigrateConfig> {
    if !config_path.exists() {
        return Ok(MigrateConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: MigrateConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use tempfile::tempdir;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/config.toml")).expect("load config");
        assert_eq!(config, MigrateConfig::default());
        assert!(config.skip_existing());
        assert!(config.verify_assignments());
        assert_eq!(config.backoff_policy(), BackoffPolicy::default());
    }

    #[test]
    fn load_config_parses_all_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[source]
host = "acme.atlassian.net"
email = "bot@acme.test"
space_key = "ENG"

[destination]
host = "https://docs.acme.test/"
token_id = "abc"
shelf_name = "Engineering"
default_owner_id = 3

[sync]
skip_existing = false
scope_book_name = "Engineering Misc"

[backoff]
initial_delay_ms = 50
max_delay_ms = 400

[identities]
"557058:aaaa" = 12
"alice@acme.test" = 14
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(config.source.space_key.as_deref(), Some("ENG"));
        assert_eq!(config.destination.default_owner_id, Some(3));
        assert!(!config.skip_existing());
        assert_eq!(config.scope_book_name(), "Engineering Misc");
        assert_eq!(config.identities.get("alice@acme.test"), Some(&14));
        let policy = config.backoff_policy();
        assert_eq!(policy.initial_delay.as_millis(), 50);
        assert_eq!(policy.max_delay.as_millis(), 400);
        assert_eq!(policy.cooldown.as_millis(), u128::from(DEFAULT_COOLDOWN_MS));
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[source\nhost = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn environment_overrides_file_values_and_supplies_secrets() {
        let mut config = MigrateConfig::default();
        config.source.space_key = Some("OLD".to_string());
        config.apply_overrides_from(lookup(&[
            ("CONFLUENCE_HOST", "acme.atlassian.net"),
            ("CONFLUENCE_EMAIL", "bot@acme.test"),
            ("CONFLUENCE_API_TOKEN", "secret-1"),
            ("CONFLUENCE_SPACE_KEY", "NEW"),
            ("BOOKSTACK_HOST", "http://localhost:6875"),
            ("BOOKSTACK_TOKEN_ID", "id"),
            ("BOOKSTACK_TOKEN_SECRET", "secret-2"),
            ("BOOKSTACK_SHELF", "  "),
        ]));

        assert_eq!(config.source.space_key.as_deref(), Some("NEW"));
        assert!(config.destination.shelf_name.is_none());

        let source = config.validate_source().expect("source settings");
        assert_eq!(source.host, "https://acme.atlassian.net");
        assert_eq!(source.api_token, "secret-1");

        let destination = config.validate_destination().expect("destination settings");
        assert_eq!(destination.host, "http://localhost:6875");
        assert_eq!(destination.token_secret, "secret-2");
        assert!(!format!("{:?}", config.secrets).contains("secret-2"));
    }

    #[test]
    fn validation_reports_missing_env_variable() {
        let mut config = MigrateConfig::default();
        config.destination.host = Some("https://docs.acme.test".to_string());
        config.destination.token_id = Some("id".to_string());
        let error = config.validate_destination().expect_err("secret missing");
        match error {
            ConfigError::Missing { env, .. } => assert_eq!(env, "BOOKSTACK_TOKEN_SECRET"),
            other => panic!("unexpected error: {other}"),
        }

        let error = MigrateConfig::default()
            .validate_source()
            .expect_err("host missing");
        assert!(error.to_string().contains("CONFLUENCE_HOST"));
    }

    #[test]
    fn validation_rejects_inverted_backoff_and_bad_scheme() {
        let mut config = MigrateConfig::default();
        config.apply_overrides_from(lookup(&[
            ("BOOKSTACK_HOST", "ftp://docs.acme.test"),
            ("BOOKSTACK_TOKEN_ID", "id"),
            ("BOOKSTACK_TOKEN_SECRET", "s"),
        ]));
        assert!(matches!(
            config.validate_destination(),
            Err(ConfigError::Invalid {
                setting: "destination.host",
                ..
            })
        ));

        config.destination.host = Some("docs.acme.test".to_string());
        config.backoff.initial_delay_ms = Some(500);
        config.backoff.max_delay_ms = Some(100);
        assert!(matches!(
            config.validate_destination(),
            Err(ConfigError::Invalid {
                setting: "backoff.max_delay_ms",
                ..
            })
        ));
    }

    #[test]
    fn scope_book_name_falls_back_to_space_key() {
        let mut config = MigrateConfig::default();
        assert_eq!(config.scope_book_name(), DEFAULT_SCOPE_BOOK_NAME);
        config.source.space_key = Some("OPS".to_string());
        assert_eq!(config.scope_book_name(), "OPS");
    }

    #[test]
    fn resolve_config_path_prefers_explicit() {
        let root = Path::new("/work");
        assert_eq!(
            resolve_config_path(None, root),
            PathBuf::from("/work/.wikimigrate/config.toml")
        );
        assert_eq!(
            resolve_config_path(Some(Path::new("alt.toml")), root),
            PathBuf::from("/work/alt.toml")
        );
        assert_eq!(
            resolve_config_path(Some(Path::new("/etc/wm.toml")), root),
            PathBuf::from("/etc/wm.toml")
        );
    }
}
