//! Permission guard - the single enforcement point before dispatch.
//!
//! Checks run twice per action: once as a plan-level pre-flight before
//! scheduling, and again at dispatch time after template resolution, since a
//! resolved value (a path pulled from a previous result, for instance) can
//! change allowability.
//!
//! Sandbox checks compare fully resolved real paths: the candidate is
//! canonicalised (symlinks followed) before prefix comparison. For paths
//! that do not exist yet, the nearest existing ancestor is canonicalised and
//! the remaining suffix re-appended.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::errors::{BridgeError, BridgeResult};
use crate::protocol::models::{IMLAction, IMLPlan};
use crate::security::profiles::ProfileConfig;

/// Parameter keys treated as filesystem paths across all modules.
const PATH_PARAM_KEYS: &[&str] = &[
    "path",
    "source",
    "destination",
    "output_path",
    "file_path",
    "image_path",
    "database",
];

pub struct PermissionGuard {
    profile: ProfileConfig,
    require_approval_for: Vec<String>,
    sandbox_paths: Vec<PathBuf>,
}

impl PermissionGuard {
    pub fn new(
        profile: ProfileConfig,
        require_approval_for: Vec<String>,
        sandbox_paths: Vec<PathBuf>,
    ) -> Self {
        Self {
            profile,
            require_approval_for,
            sandbox_paths,
        }
    }

    pub fn profile(&self) -> &ProfileConfig {
        &self.profile
    }

    pub fn allow_env_templates(&self) -> bool {
        self.profile.allow_env_templates
    }

    /// Plan-level pre-flight: size cap plus an early allow-check of every
    /// action so obvious permission errors surface before scheduling.
    pub fn check_plan(&self, plan: &IMLPlan) -> BridgeResult<()> {
        if plan.actions.len() > self.profile.max_plan_actions {
            return Err(BridgeError::PermissionDenied {
                module: "(plan)".to_string(),
                action: format!(
                    "{} actions exceeds profile limit of {}",
                    plan.actions.len(),
                    self.profile.max_plan_actions
                ),
                profile: self.profile.profile.as_str().to_string(),
            });
        }
        for action in &plan.actions {
            if !self.profile.is_allowed(&action.module, &action.action) {
                return Err(BridgeError::PermissionDenied {
                    module: action.module.clone(),
                    action: action.action.clone(),
                    profile: self.profile.profile.as_str().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Per-action check at dispatch time.
    ///
    /// The approval gate takes precedence: an action flagged for approval
    /// raises [`BridgeError::ApprovalRequired`] before the allow-check,
    /// unless the profile bypasses approvals entirely.
    pub fn check_action(&self, action: &IMLAction, plan_id: &str) -> BridgeResult<()> {
        if self.requires_approval(action) && !self.profile.allow_approval_bypass {
            return Err(BridgeError::ApprovalRequired {
                plan_id: plan_id.to_string(),
                action_id: action.id.clone(),
            });
        }

        if !self.profile.is_allowed(&action.module, &action.action) {
            return Err(BridgeError::PermissionDenied {
                module: action.module.clone(),
                action: action.action.clone(),
                profile: self.profile.profile.as_str().to_string(),
            });
        }

        self.check_sandbox_params(&action.module, &action.action, &action.params)
    }

    /// Validate path-like params against the sandbox. Called again after
    /// template resolution; values still containing `{{` are skipped here
    /// and caught on the second pass.
    pub fn check_sandbox_params(
        &self,
        module: &str,
        action: &str,
        params: &Value,
    ) -> BridgeResult<()> {
        if self.sandbox_paths.is_empty() {
            return Ok(());
        }
        let Some(map) = params.as_object() else {
            return Ok(());
        };
        for key in PATH_PARAM_KEYS {
            if let Some(Value::String(raw)) = map.get(*key) {
                if raw.contains("{{") {
                    continue;
                }
                self.validate_sandbox_path(raw, module, action)?;
            }
        }
        Ok(())
    }

    fn requires_approval(&self, action: &IMLAction) -> bool {
        action.requires_approval
            || self
                .require_approval_for
                .iter()
                .any(|key| key == &action.dispatch_key())
    }

    fn validate_sandbox_path(&self, raw: &str, module: &str, action: &str) -> BridgeResult<()> {
        let resolved = resolve_real_path(Path::new(raw));
        for sandbox in &self.sandbox_paths {
            let sandbox_resolved = resolve_real_path(sandbox);
            if resolved == sandbox_resolved || resolved.starts_with(&sandbox_resolved) {
                return Ok(());
            }
        }
        log::warn!(
            "[PermissionGuard] {}.{} path '{}' escapes the sandbox",
            module,
            action,
            raw
        );
        Err(BridgeError::PermissionDenied {
            module: module.to_string(),
            action: format!("{} (path '{}' outside sandbox)", action, raw),
            profile: self.profile.profile.as_str().to_string(),
        })
    }
}

/// Canonicalise with symlinks followed. A path that does not exist yet is
/// resolved through its nearest existing ancestor so writes to new files
/// inside the sandbox still validate.
fn resolve_real_path(path: &Path) -> PathBuf {
    if let Ok(resolved) = path.canonicalize() {
        return resolved;
    }
    let mut suffix: Vec<std::ffi::OsString> = Vec::new();
    let mut current = path.to_path_buf();
    while let Some(parent) = current.parent() {
        if let Some(name) = current.file_name() {
            suffix.push(name.to_os_string());
        }
        if let Ok(resolved) = parent.canonicalize() {
            let mut out = resolved;
            for part in suffix.iter().rev() {
                out.push(part);
            }
            return out;
        }
        current = parent.to_path_buf();
    }
    path.to_path_buf()
}
