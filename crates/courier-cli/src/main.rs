mod auth;
mod config;
mod rate_limit;
mod run_cmd;
mod serve_cmd;

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use courier_core::backend::http::{HttpBrowser, HttpLlm};
use courier_core::backend::mock::{MockBrowser, MockLlm};
use courier_core::backend::{BrowserBackend, LlmBackend};
use courier_core::breaker::ServiceBreakers;
use courier_core::events::EventBroadcaster;
use courier_core::executor::StepExecutor;
use courier_core::limiter::RateLimiter;
use courier_core::pipeline::{Pipeline, PipelineConfig};
use courier_core::planner::PlannerAdapter;
use courier_store::TaskStore;

use auth::AuthRegistry;
use config::Settings;

#[derive(Parser)]
#[command(
    name = "courier",
    about = "Planner-driven orchestrator for autonomous web tasks"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP/WebSocket server
    Serve {
        /// Bind address (overrides COURIER_APP_HOST)
        #[arg(long)]
        host: Option<String>,
        /// Bind port (overrides COURIER_APP_PORT)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Execute a single command and print the formatted result
    Run {
        /// The natural-language command to execute
        command: String,
        /// Output format: json, csv, or summary
        #[arg(long, default_value = "json")]
        format: String,
    },
}

/// Process-wide services wired from settings.
struct Runtime {
    pipeline: Arc<Pipeline>,
    breakers: ServiceBreakers,
}

async fn build_runtime(settings: &Settings) -> Runtime {
    let browser: Arc<dyn BrowserBackend> = if settings.has_browser_credentials() {
        Arc::new(HttpBrowser::new(
            settings.browser_endpoint.clone(),
            settings.browser_api_key.clone(),
            settings.headless_browser,
        ))
    } else {
        tracing::info!("browser agent not configured, using mock backend");
        Arc::new(MockBrowser::new())
    };

    let llm: Arc<dyn LlmBackend> = if settings.has_llm_credentials() {
        tracing::info!(
            model = %settings.llm_model,
            region = %settings.llm_region,
            "using live llm backend"
        );
        Arc::new(HttpLlm::new(
            settings.llm_endpoint.clone(),
            settings.llm_api_key.clone(),
            settings.llm_model.clone(),
        ))
    } else {
        tracing::info!("llm service not configured, using mock backend");
        Arc::new(MockLlm::new())
    };

    let redis_url = if settings.redis_url.is_empty() {
        None
    } else {
        Some(settings.redis_url.as_str())
    };
    let store = Arc::new(TaskStore::connect(redis_url).await);
    let broadcaster = Arc::new(EventBroadcaster::new());
    let breakers = ServiceBreakers::new();

    let planner = PlannerAdapter::new(Arc::clone(&llm));
    let executor = Arc::new(StepExecutor::new(
        Arc::clone(&browser),
        llm,
        breakers.clone(),
        Duration::from_secs(settings.browser_timeout_seconds),
    ));

    let pipeline = Arc::new(Pipeline::new(
        store,
        broadcaster,
        planner,
        executor,
        browser,
        PipelineConfig {
            max_sessions: settings.max_concurrent_browsers,
            browser_timeout: Duration::from_secs(settings.browser_timeout_seconds),
        },
    ));

    Runtime { pipeline, breakers }
}

fn init_tracing(settings: &Settings) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // Human-readable output locally, NDJSON in deployed environments.
    if settings.is_dev() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut settings = Settings::from_env();
    init_tracing(&settings);

    if settings.jwt_algorithm != "HS256" {
        tracing::warn!(
            algorithm = %settings.jwt_algorithm,
            "only HS256 tokens are supported, ignoring configured algorithm"
        );
        settings.jwt_algorithm = "HS256".to_string();
    }

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                settings.app_host = host;
            }
            if let Some(port) = port {
                settings.app_port = port;
            }

            let runtime = build_runtime(&settings).await;
            let limiter = Arc::new(RateLimiter::new(settings.limiter_config()));
            let auth = Arc::new(AuthRegistry::new(
                settings.jwt_secret.clone(),
                settings.jwt_expiry_minutes,
            ));

            let state = serve_cmd::AppState {
                pipeline: runtime.pipeline,
                auth,
                breakers: runtime.breakers,
                settings: Arc::new(settings),
            };
            serve_cmd::run_serve(state, limiter).await?;
        }
        Commands::Run { command, format } => {
            let format = format
                .parse()
                .map_err(|_| anyhow::anyhow!("unknown output format {format:?}"))?;
            let runtime = build_runtime(&settings).await;
            run_cmd::run_command(&runtime.pipeline, &command, format).await?;
        }
    }

    Ok(())
}
