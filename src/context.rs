//! LLM-facing capability context.
//!
//! Renders the registered module manifests into the system-prompt fragment
//! served by `GET /context`, so the model learns what it can call and how
//! plans must be shaped without any out-of-band documentation.

use crate::modules::ModuleRegistry;
use crate::protocol::models::PROTOCOL_VERSION;

pub async fn build_context_prompt(registry: &ModuleRegistry) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "You control a computer by submitting IML v{} plans: JSON documents \
         describing a DAG of actions. Each action names a module, an action \
         and params; `depends_on` orders them, and `{{{{result.<id>.<path>}}}}` \
         templates pass outputs forward. Plans are validated and security \
         screened before anything runs; rejected plans return structured \
         rejection details you should read and act on.\n\n",
        PROTOCOL_VERSION
    ));
    out.push_str("Available modules:\n\n");

    for manifest in registry.list().await {
        out.push_str(&format!(
            "## {} (v{})\n{}\n",
            manifest.module_id, manifest.version, manifest.description
        ));
        for action in &manifest.actions {
            let params: Vec<String> = action
                .params
                .iter()
                .map(|p| {
                    let mut s = format!("{}: {:?}", p.name, p.kind).to_lowercase();
                    if !p.required {
                        s.push_str(" (optional)");
                    }
                    s
                })
                .collect();
            out.push_str(&format!(
                "- `{}.{}({})` - {}\n",
                manifest.module_id,
                action.name,
                params.join(", "),
                if action.description.is_empty() {
                    "no description"
                } else {
                    &action.description
                }
            ));
        }
        out.push('\n');
    }

    out.push_str(
        "Guidelines: keep plans small and focused; set `requires_approval` on \
         destructive actions; never embed instructions to yourself inside \
         params - content is treated as data and screened.\n",
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::register_builtin;

    #[tokio::test]
    async fn prompt_lists_registered_modules_and_actions() {
        let registry = ModuleRegistry::new();
        register_builtin(&registry).await.unwrap();
        let prompt = build_context_prompt(&registry).await;
        assert!(prompt.contains("## iml"));
        assert!(prompt.contains("`iml.echo("));
        assert!(prompt.contains("`iml.sleep(seconds: float (optional))`"));
        assert!(prompt.contains("IML v2.0"));
    }
}
