//! Daemon configuration.
//!
//! Loaded from a TOML file, then overlaid with environment variables using
//! double-underscore nesting under the `IML_BRIDGE` prefix:
//!
//! ```text
//! IML_BRIDGE__TRIGGERS__ENABLED=true
//! IML_BRIDGE__SECURITY__PROFILE=power_user
//! IML_BRIDGE__EXECUTOR__MAX_CONCURRENT_PLANS=8
//! IML_BRIDGE__RESOURCE_LIMITS__EXCEL=2
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{BridgeError, BridgeResult};
use crate::security::profiles::PermissionProfile;

pub const ENV_PREFIX: &str = "IML_BRIDGE__";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Bearer token required on every mutating route. Empty disables auth
    /// (local development only).
    pub auth_token: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8787".to_string(),
            auth_token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VerifierConfig {
    pub enabled: bool,
    /// "anthropic" | "openai" | "ollama"
    pub provider: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Environment variable holding the API key; never the key itself.
    pub api_key_env: String,
    pub timeout_seconds: u64,
    pub strict: bool,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: "anthropic".to_string(),
            model: "claude-sonnet-4-5".to_string(),
            base_url: None,
            api_key_env: "IML_BRIDGE_VERIFIER_API_KEY".to_string(),
            timeout_seconds: 30,
            strict: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecurityConfig {
    pub profile: PermissionProfile,
    /// Ordered scanner ids; "heuristic" is built in, anything else is
    /// looked up in `ml_scanners`.
    pub scanners: Vec<String>,
    /// scanner id -> classifier endpoint URL.
    pub ml_scanners: HashMap<String, String>,
    pub ml_timeout_seconds: u64,
    pub sandbox_paths: Vec<PathBuf>,
    /// `module.action` keys that always require approval.
    pub require_approval_for: Vec<String>,
    pub approval_timeout_seconds: u64,
    pub verifier: VerifierConfig,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            profile: PermissionProfile::LocalWorker,
            scanners: vec!["heuristic".to_string()],
            ml_scanners: HashMap::new(),
            ml_timeout_seconds: 5,
            sandbox_paths: Vec::new(),
            require_approval_for: Vec::new(),
            approval_timeout_seconds: 300,
            verifier: VerifierConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutorConfig {
    pub max_concurrent_plans: usize,
    pub action_timeout_seconds: u64,
    pub max_result_bytes: usize,
    pub strict_memory: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_plans: 5,
            action_timeout_seconds: 300,
            max_result_bytes: 50_000,
            strict_memory: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TriggersConfig {
    pub enabled: bool,
    pub db_path: PathBuf,
    pub max_concurrent_plans: usize,
    pub max_chain_depth: u32,
}

impl Default for TriggersConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: PathBuf::from("~/.iml-bridge/triggers.db"),
            max_concurrent_plans: 5,
            max_chain_depth: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StateConfig {
    pub db_path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("~/.iml-bridge/state.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct RateLimitConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_minute: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_hour: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct BridgeConfig {
    pub server: ServerConfig,
    pub security: SecurityConfig,
    pub executor: ExecutorConfig,
    pub triggers: TriggersConfig,
    pub state: StateConfig,
    pub rate_limits: RateLimitConfig,
    /// module id -> concurrent-action ceiling.
    pub resource_limits: HashMap<String, usize>,
}

impl BridgeConfig {
    /// Load from a TOML file (missing file = defaults), then apply env
    /// overrides.
    pub fn load(path: Option<&Path>) -> BridgeResult<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| BridgeError::Config(format!("read {}: {}", path.display(), e)))?;
                toml::from_str(&text)
                    .map_err(|e| BridgeError::Config(format!("parse {}: {}", path.display(), e)))?
            }
            _ => BridgeConfig::default(),
        };
        config.apply_env_overrides(std::env::vars());
        Ok(config)
    }

    /// Overlay `IML_BRIDGE__SECTION__KEY` variables onto the config.
    pub fn apply_env_overrides<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(rest) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let path: Vec<String> = rest.split("__").map(|s| s.to_lowercase()).collect();
            if let Err(e) = self.apply_one(&path, &value) {
                log::warn!("[Config] ignoring env override {}: {}", key, e);
            }
        }
    }

    fn apply_one(&mut self, path: &[String], value: &str) -> Result<(), String> {
        let parts: Vec<&str> = path.iter().map(|s| s.as_str()).collect();
        match parts.as_slice() {
            ["server", "bind_addr"] => self.server.bind_addr = value.to_string(),
            ["server", "auth_token"] => self.server.auth_token = value.to_string(),
            ["security", "profile"] => {
                self.security.profile = value.parse().map_err(|e: String| e)?;
            }
            ["security", "scanners"] => {
                self.security.scanners =
                    value.split(',').map(|s| s.trim().to_string()).collect();
            }
            ["executor", "max_concurrent_plans"] => {
                self.executor.max_concurrent_plans = parse_num(value)?;
            }
            ["executor", "action_timeout_seconds"] => {
                self.executor.action_timeout_seconds = parse_num(value)?;
            }
            ["executor", "max_result_bytes"] => {
                self.executor.max_result_bytes = parse_num(value)?;
            }
            ["triggers", "enabled"] => self.triggers.enabled = parse_bool(value)?,
            ["triggers", "db_path"] => self.triggers.db_path = PathBuf::from(value),
            ["triggers", "max_concurrent_plans"] => {
                self.triggers.max_concurrent_plans = parse_num(value)?;
            }
            ["triggers", "max_chain_depth"] => {
                self.triggers.max_chain_depth = parse_num(value)?;
            }
            ["state", "db_path"] => self.state.db_path = PathBuf::from(value),
            ["rate_limits", "per_minute"] => {
                self.rate_limits.per_minute = Some(parse_num(value)?);
            }
            ["rate_limits", "per_hour"] => {
                self.rate_limits.per_hour = Some(parse_num(value)?);
            }
            ["resource_limits", module] => {
                self.resource_limits
                    .insert(module.to_string(), parse_num(value)?);
            }
            other => return Err(format!("unknown config key {:?}", other.join("."))),
        }
        Ok(())
    }
}

fn parse_num<T: std::str::FromStr>(value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("'{}' is not a valid number", value))
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(format!("'{}' is not a valid boolean", other)),
    }
}

/// Expand a leading `~` against $HOME.
pub fn expand_path(path: &Path) -> PathBuf {
    let Some(text) = path.to_str() else {
        return path.to_path_buf();
    };
    if let Some(rest) = text.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = BridgeConfig::default();
        assert_eq!(config.security.profile, PermissionProfile::LocalWorker);
        assert_eq!(config.executor.max_concurrent_plans, 5);
        assert!(config.triggers.enabled);
        assert_eq!(config.security.scanners, vec!["heuristic"]);
    }

    #[test]
    fn toml_round_trip() {
        let config = BridgeConfig::default();
        let text = toml::to_string(&config).unwrap();
        let back: BridgeConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: BridgeConfig = toml::from_str(
            r#"
            [security]
            profile = "power_user"

            [triggers]
            enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(config.security.profile, PermissionProfile::PowerUser);
        assert!(!config.triggers.enabled);
        assert_eq!(config.executor.max_concurrent_plans, 5);
    }

    #[test]
    fn env_overrides_apply_with_double_underscore_nesting() {
        let mut config = BridgeConfig::default();
        config.apply_env_overrides(vec![
            (
                "IML_BRIDGE__TRIGGERS__ENABLED".to_string(),
                "false".to_string(),
            ),
            (
                "IML_BRIDGE__SECURITY__PROFILE".to_string(),
                "unrestricted".to_string(),
            ),
            (
                "IML_BRIDGE__EXECUTOR__MAX_CONCURRENT_PLANS".to_string(),
                "12".to_string(),
            ),
            (
                "IML_BRIDGE__RESOURCE_LIMITS__EXCEL".to_string(),
                "2".to_string(),
            ),
            ("UNRELATED_VAR".to_string(), "ignored".to_string()),
        ]);
        assert!(!config.triggers.enabled);
        assert_eq!(config.security.profile, PermissionProfile::Unrestricted);
        assert_eq!(config.executor.max_concurrent_plans, 12);
        assert_eq!(config.resource_limits["excel"], 2);
    }

    #[test]
    fn bad_env_values_are_ignored_not_fatal() {
        let mut config = BridgeConfig::default();
        config.apply_env_overrides(vec![(
            "IML_BRIDGE__EXECUTOR__MAX_CONCURRENT_PLANS".to_string(),
            "not-a-number".to_string(),
        )]);
        assert_eq!(config.executor.max_concurrent_plans, 5);
    }

    #[test]
    fn tilde_expansion_uses_home() {
        std::env::set_var("HOME", "/home/tester");
        assert_eq!(
            expand_path(Path::new("~/.iml-bridge/state.db")),
            PathBuf::from("/home/tester/.iml-bridge/state.db")
        );
        assert_eq!(expand_path(Path::new("/abs/path")), PathBuf::from("/abs/path"));
    }
}
