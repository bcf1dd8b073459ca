use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use forgeci::api::{self, ApiState};
use forgeci::backend::bodhi::{BodhiReleaseBackend, InMemoryBodhiApi};
use forgeci::backend::copr::{CoprBuildBackend, InMemoryCoprApi};
use forgeci::backend::testing_farm::{InMemoryTestingFarmApi, TestingFarmBackend};
use forgeci::backend::BackendRegistry;
use forgeci::config::{RetryConfig, SandboxConfig, ServiceConfig};
use forgeci::dispatch::Dispatcher;
use forgeci::queue::work_queue;
use forgeci::sandbox::SandboxRunner;
use forgeci::shutdown;
use forgeci::status::LogReporter;
use forgeci::store::{JobStore, MemoryStore};
use forgeci::supervisor::Supervisor;
use forgeci::worker::{WorkerContext, WorkerPool};

#[derive(Parser, Debug)]
#[command(name = "forgeci")]
#[command(version)]
#[command(about = "Event-driven CI orchestration core for forge projects")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the orchestration service
    Serve(ServeArgs),
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Address to listen on for the HTTP API
    #[arg(long, default_value = "127.0.0.1:8559")]
    listen: SocketAddr,

    /// Number of concurrent worker tasks
    #[arg(long, default_value = "4")]
    workers: usize,

    /// Bounded work queue capacity
    #[arg(long, default_value = "1024")]
    queue_capacity: usize,

    /// Maximum retry attempts per job before failing permanently
    #[arg(long, default_value = "3")]
    retry_budget: u32,

    /// Container image for sandboxed recipe execution
    #[arg(long, default_value = "registry.fedoraproject.org/fedora:latest")]
    image: String,

    /// Run recipes directly instead of inside a container.
    /// Intended for development only.
    #[arg(long)]
    no_container: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Serve(serve_args) => run_service(serve_args).await,
    }
}

async fn run_service(args: ServeArgs) {
    let sandbox_config = SandboxConfig {
        image: args.image,
        use_container: !args.no_container,
        ..SandboxConfig::default()
    };
    let retry = RetryConfig {
        budget: args.retry_budget,
        ..RetryConfig::default()
    };
    let config = ServiceConfig::new(args.listen)
        .with_workers(args.workers)
        .with_queue_capacity(args.queue_capacity)
        .with_retry(retry)
        .with_sandbox(sandbox_config);

    tracing::info!(
        listen_addr = %config.listen_addr,
        workers = config.workers,
        queue_capacity = config.queue_capacity,
        retry_budget = config.retry.budget,
        use_container = config.sandbox.use_container,
        "Starting forgeci service"
    );

    // Real Copr/Testing Farm/Bodhi clients are wired up by the deployment
    // binary through the library API; the bundled in-memory transports make
    // a standalone instance useful for local development.
    tracing::warn!("Using in-memory backend transports, external submissions are simulated");

    let store: Arc<dyn JobStore> = Arc::new(MemoryStore::new());
    let (queue_tx, queue_rx) = work_queue(config.queue_capacity);
    let sandbox = Arc::new(SandboxRunner::new(config.sandbox.clone()));

    let registry = Arc::new(
        BackendRegistry::new()
            .register(Arc::new(CoprBuildBackend::new(
                Arc::new(InMemoryCoprApi::new()),
                sandbox,
                config.recipe.clone(),
                config.sandbox.timeout,
            )))
            .register(Arc::new(TestingFarmBackend::new(Arc::new(
                InMemoryTestingFarmApi::new(),
            ))))
            .register(Arc::new(BodhiReleaseBackend::new(Arc::new(
                InMemoryBodhiApi::new(),
            )))),
    );

    let reporter = Arc::new(LogReporter);

    let token = shutdown::install_shutdown_handler();

    let ctx = WorkerContext {
        store: Arc::clone(&store),
        registry: Arc::clone(&registry),
        reporter: reporter.clone(),
        retry: config.retry.clone(),
    };
    let worker_handles = WorkerPool::spawn(config.workers, ctx, queue_rx, token.clone());

    let supervisor = Arc::new(Supervisor::new(
        Arc::clone(&store),
        queue_tx.clone(),
        Arc::clone(&registry),
        reporter.clone(),
        config.retry.clone(),
    ));
    let supervisor_handle = Arc::clone(&supervisor).spawn(token.clone());

    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&store), queue_tx));
    let state = ApiState {
        store,
        dispatcher,
        supervisor,
    };

    api::serve(config.listen_addr, state, token.clone()).await;

    // The API server returns once the token fires; give the workers a
    // bounded window to finish in-flight jobs.
    token.cancel();
    shutdown::drain(worker_handles, Duration::from_secs(30)).await;
    if let Err(e) = supervisor_handle.await {
        tracing::warn!(error = %e, "Supervisor task panicked during shutdown");
    }
    tracing::info!("Shutdown complete");
}
