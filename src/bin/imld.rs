//! imld - the IML bridge daemon.
//!
//! Wires configuration, stores, the module registry, the security stack,
//! the executor and the trigger daemon together, then serves the HTTP and
//! WebSocket API until the process is stopped.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use iml_bridge::api::{serve, AppState};
use iml_bridge::config::{expand_path, BridgeConfig};
use iml_bridge::errors::BridgeResult;
use iml_bridge::events::{InProcessBus, SessionContextPropagator};
use iml_bridge::memory::KeyValueStore;
use iml_bridge::modules::{register_builtin, ModuleRegistry};
use iml_bridge::orchestration::approval::{ApprovalGate, TimeoutBehavior};
use iml_bridge::orchestration::executor::{ExecutorParts, ExecutorSettings, PlanExecutor};
use iml_bridge::orchestration::group::PlanGroupExecutor;
use iml_bridge::orchestration::resources::ResourceManager;
use iml_bridge::security::guard::PermissionGuard;
use iml_bridge::security::llm::{
    AnthropicClient, LlmClient, NullLlmClient, OllamaClient, OpenAiClient,
};
use iml_bridge::security::profiles::profile_config;
use iml_bridge::security::rate_limiter::{ActionRateLimiter, RateLimits};
use iml_bridge::security::sanitizer::OutputSanitizer;
use iml_bridge::security::scanners::{
    HeuristicScanner, MlScannerAdapter, Scanner, SecurityPipeline,
};
use iml_bridge::security::verifier::IntentVerifier;
use iml_bridge::store::PlanStateStore;
use iml_bridge::triggers::daemon::{TriggerDaemon, TriggerDaemonConfig};
use iml_bridge::triggers::store::TriggerStore;

#[derive(Parser)]
#[command(name = "imld", about = "IML bridge daemon", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon.
    Serve {
        /// Path to the TOML configuration file.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override the bind address from the config.
        #[arg(long)]
        bind: Option<String>,
    },
    /// Print the effective configuration and exit.
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("imld=info".parse().expect("static directive"))
                .add_directive("iml_bridge=info".parse().expect("static directive")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Serve { config, bind } => run_serve(config, bind).await,
        Command::Config { config } => run_config(config),
    };
    if let Err(e) = result {
        log::error!("[imld] fatal: {}", e);
        std::process::exit(1);
    }
}

fn run_config(config_path: Option<PathBuf>) -> BridgeResult<()> {
    let config = BridgeConfig::load(config_path.as_deref())?;
    let text = toml::to_string_pretty(&config)
        .map_err(|e| iml_bridge::BridgeError::Config(e.to_string()))?;
    println!("{}", text);
    Ok(())
}

async fn run_serve(config_path: Option<PathBuf>, bind: Option<String>) -> BridgeResult<()> {
    let mut config = BridgeConfig::load(config_path.as_deref())?;
    if let Some(bind) = bind {
        config.server.bind_addr = bind;
    }

    // Stores.
    let state_store = Arc::new(PlanStateStore::open(&expand_path(&config.state.db_path))?);

    // Modules. Concrete capability modules register through the library
    // API; the built-in diagnostics module is always present.
    let registry = Arc::new(ModuleRegistry::new());
    register_builtin(&registry).await?;

    // Security stack.
    let mut scanners: Vec<Arc<dyn Scanner>> = Vec::new();
    for scanner_id in &config.security.scanners {
        if scanner_id == "heuristic" {
            scanners.push(Arc::new(HeuristicScanner::new()));
        } else if let Some(endpoint) = config.security.ml_scanners.get(scanner_id) {
            scanners.push(Arc::new(MlScannerAdapter::new(
                scanner_id,
                endpoint,
                Duration::from_secs(config.security.ml_timeout_seconds),
            )));
        } else {
            log::warn!("[imld] unknown scanner '{}' skipped", scanner_id);
        }
    }
    let pipeline = (!scanners.is_empty()).then(|| Arc::new(SecurityPipeline::new(scanners)));

    let verifier = if config.security.verifier.enabled {
        let vc = &config.security.verifier;
        let api_key = std::env::var(&vc.api_key_env).unwrap_or_default();
        let client: Arc<dyn LlmClient> = match vc.provider.as_str() {
            "anthropic" => Arc::new(AnthropicClient::new(
                &api_key,
                &vc.model,
                vc.base_url.as_deref(),
            )),
            "openai" => Arc::new(OpenAiClient::new(
                &api_key,
                &vc.model,
                vc.base_url.as_deref(),
            )),
            "ollama" => Arc::new(OllamaClient::new(&vc.model, vc.base_url.as_deref())),
            other => {
                log::warn!("[imld] unknown verifier provider '{}', disabling", other);
                Arc::new(NullLlmClient)
            }
        };
        Some(Arc::new(IntentVerifier::new(
            client,
            vc.strict,
            Duration::from_secs(vc.timeout_seconds),
        )))
    } else {
        None
    };

    let guard = Arc::new(PermissionGuard::new(
        profile_config(config.security.profile),
        config.security.require_approval_for.clone(),
        config
            .security
            .sandbox_paths
            .iter()
            .map(|p| expand_path(p))
            .collect(),
    ));

    // Shared runtime services.
    let bus = Arc::new(InProcessBus::new());
    let propagator = Arc::new(SessionContextPropagator::new());
    let resources = Arc::new(ResourceManager::new(config.resource_limits.clone(), 10));
    let approvals = Arc::new(ApprovalGate::new(
        Duration::from_secs(config.security.approval_timeout_seconds),
        TimeoutBehavior::Reject,
    ));

    let executor = PlanExecutor::new(
        ExecutorParts {
            registry: registry.clone(),
            guard,
            store: state_store.clone(),
            pipeline,
            verifier,
            sanitizer: Arc::new(OutputSanitizer::new(config.executor.max_result_bytes)),
            approvals,
            memory: Arc::new(KeyValueStore::new()),
            resources,
            limiter: Arc::new(ActionRateLimiter::new(RateLimits {
                per_minute: config.rate_limits.per_minute,
                per_hour: config.rate_limits.per_hour,
            })),
            bus: bus.clone(),
            propagator: propagator.clone(),
        },
        ExecutorSettings {
            max_concurrent_plans: config.executor.max_concurrent_plans,
            action_timeout: Duration::from_secs(config.executor.action_timeout_seconds),
            strict_memory: config.executor.strict_memory,
        },
    );

    // Trigger daemon.
    let triggers = if config.triggers.enabled {
        let trigger_store = Arc::new(TriggerStore::open(&expand_path(&config.triggers.db_path))?);
        let daemon = TriggerDaemon::new(
            trigger_store,
            executor.clone(),
            bus.clone(),
            propagator.clone(),
            TriggerDaemonConfig {
                max_concurrent_plans: config.triggers.max_concurrent_plans,
                max_chain_depth: config.triggers.max_chain_depth,
                health_interval: Duration::from_secs(30),
            },
        );
        daemon.start().await?;
        Some(daemon)
    } else {
        log::info!("[imld] trigger subsystem disabled");
        None
    };

    let state = Arc::new(AppState {
        groups: Arc::new(PlanGroupExecutor::new(executor.clone())),
        executor,
        registry,
        store: state_store,
        bus,
        triggers: triggers.clone(),
        auth_token: config.server.auth_token.clone(),
    });

    let bind_addr = config.server.bind_addr.clone();
    let serve_result = tokio::select! {
        result = serve(state, &bind_addr) => result,
        _ = tokio::signal::ctrl_c() => {
            log::info!("[imld] shutdown signal received");
            Ok(())
        }
    };

    if let Some(daemon) = triggers {
        daemon.shutdown().await;
    }
    serve_result
}
