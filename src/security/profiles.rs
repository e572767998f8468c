//! Permission profiles.
//!
//! Four built-in profiles, least to most permissive:
//!
//! ```text
//! readonly       read-only filesystem / system-info / database reads
//! local_worker   default; file writes, safe commands, HTTP calls
//! power_user     adds browser, GUI automation, deletes, database writes
//! unrestricted   everything; approval gates are bypassed
//! ```
//!
//! A profile is a set of `module.action` allow patterns with an optional
//! deny list that takes precedence. `*` matches one dotted segment, so
//! `filesystem.*` allows the whole module and `*.*` allows everything.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PermissionProfile {
    Readonly,
    #[default]
    LocalWorker,
    PowerUser,
    Unrestricted,
}

impl PermissionProfile {
    pub fn as_str(self) -> &'static str {
        match self {
            PermissionProfile::Readonly => "readonly",
            PermissionProfile::LocalWorker => "local_worker",
            PermissionProfile::PowerUser => "power_user",
            PermissionProfile::Unrestricted => "unrestricted",
        }
    }
}

impl std::str::FromStr for PermissionProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "readonly" => Ok(PermissionProfile::Readonly),
            "local_worker" => Ok(PermissionProfile::LocalWorker),
            "power_user" => Ok(PermissionProfile::PowerUser),
            "unrestricted" => Ok(PermissionProfile::Unrestricted),
            other => Err(format!("unknown permission profile '{}'", other)),
        }
    }
}

/// Resolved permission configuration for one profile.
#[derive(Debug, Clone)]
pub struct ProfileConfig {
    pub profile: PermissionProfile,
    pub allowed_patterns: Vec<String>,
    pub denied_patterns: Vec<String>,
    pub max_plan_actions: usize,
    pub allow_env_templates: bool,
    pub allow_approval_bypass: bool,
}

impl ProfileConfig {
    /// Deny patterns win over allow patterns.
    pub fn is_allowed(&self, module_id: &str, action_name: &str) -> bool {
        let key = format!("{}.{}", module_id, action_name);
        if self
            .denied_patterns
            .iter()
            .any(|p| pattern_matches(p, &key))
        {
            return false;
        }
        self.allowed_patterns
            .iter()
            .any(|p| pattern_matches(p, &key))
    }
}

/// Segment-wise wildcard match: `*` covers exactly one dotted segment.
fn pattern_matches(pattern: &str, key: &str) -> bool {
    let pattern_parts: Vec<&str> = pattern.split('.').collect();
    let key_parts: Vec<&str> = key.split('.').collect();
    if pattern_parts.len() != key_parts.len() {
        return false;
    }
    pattern_parts
        .iter()
        .zip(key_parts.iter())
        .all(|(p, k)| *p == "*" || p == k)
}

fn readonly_allowed() -> Vec<String> {
    [
        "filesystem.read_file",
        "filesystem.list_directory",
        "filesystem.search_files",
        "filesystem.get_file_info",
        "os_exec.list_processes",
        "os_exec.get_system_info",
        "database.fetch_results",
        "database.list_tables",
        "database.get_table_schema",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn local_worker_allowed() -> Vec<String> {
    let mut allowed = readonly_allowed();
    allowed.extend(
        [
            "filesystem.write_file",
            "filesystem.append_file",
            "filesystem.copy_file",
            "filesystem.move_file",
            "filesystem.create_directory",
            "os_exec.run_command",
            "excel.*",
            "word.*",
            "api_http.http_get",
            "api_http.http_post",
            "api_http.http_put",
            "api_http.http_delete",
            "database.execute_query",
            "database.insert_record",
            "database.update_record",
            "iml.*",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    allowed
}

fn local_worker_denied() -> Vec<String> {
    [
        "filesystem.delete_file",
        "os_exec.kill_process",
        "database.delete_record",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn power_user_allowed() -> Vec<String> {
    let mut allowed = local_worker_allowed();
    allowed.extend(
        [
            "filesystem.delete_file",
            "os_exec.kill_process",
            "browser.*",
            "gui.*",
            "database.*",
            "triggers.*",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    allowed
}

/// Resolve the built-in configuration for `profile`.
pub fn profile_config(profile: PermissionProfile) -> ProfileConfig {
    match profile {
        PermissionProfile::Readonly => ProfileConfig {
            profile,
            allowed_patterns: readonly_allowed(),
            denied_patterns: Vec::new(),
            max_plan_actions: 20,
            allow_env_templates: false,
            allow_approval_bypass: false,
        },
        PermissionProfile::LocalWorker => ProfileConfig {
            profile,
            allowed_patterns: local_worker_allowed(),
            denied_patterns: local_worker_denied(),
            max_plan_actions: 50,
            allow_env_templates: true,
            allow_approval_bypass: false,
        },
        PermissionProfile::PowerUser => ProfileConfig {
            profile,
            allowed_patterns: power_user_allowed(),
            denied_patterns: Vec::new(),
            max_plan_actions: 200,
            allow_env_templates: true,
            allow_approval_bypass: false,
        },
        PermissionProfile::Unrestricted => ProfileConfig {
            profile,
            allowed_patterns: vec!["*.*".to_string()],
            denied_patterns: Vec::new(),
            max_plan_actions: 500,
            allow_env_templates: true,
            allow_approval_bypass: true,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readonly_allows_reads_but_not_writes() {
        let config = profile_config(PermissionProfile::Readonly);
        assert!(config.is_allowed("filesystem", "read_file"));
        assert!(!config.is_allowed("filesystem", "write_file"));
    }

    #[test]
    fn deny_list_overrides_allow() {
        let config = profile_config(PermissionProfile::LocalWorker);
        assert!(config.is_allowed("filesystem", "write_file"));
        assert!(!config.is_allowed("filesystem", "delete_file"));
    }

    #[test]
    fn module_wildcard_covers_all_actions() {
        let config = profile_config(PermissionProfile::LocalWorker);
        assert!(config.is_allowed("excel", "set_cell"));
        assert!(config.is_allowed("excel", "anything_else"));
        assert!(!config.is_allowed("browser", "navigate"));
    }

    #[test]
    fn unrestricted_allows_everything_and_bypasses_approval() {
        let config = profile_config(PermissionProfile::Unrestricted);
        assert!(config.is_allowed("anything", "at_all"));
        assert!(config.allow_approval_bypass);
    }

    #[test]
    fn wildcard_is_per_segment() {
        assert!(pattern_matches("a.*", "a.b"));
        assert!(!pattern_matches("a.*", "a.b.c"));
        assert!(pattern_matches("*.*", "x.y"));
    }
}
