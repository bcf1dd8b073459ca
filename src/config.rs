use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for sandboxed execution of packaging operations.
///
/// Repository-derived commands (recipe rendering, source archive creation)
/// run in ephemeral containers so untrusted content never executes in the
/// worker's own process.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Container image used for sandboxed commands
    pub image: String,
    /// Disable network access inside the sandbox
    pub network_disabled: bool,
    /// Memory limit (e.g., "256m")
    pub memory_limit: Option<String>,
    /// CPU limit (e.g., "0.5" for half a CPU)
    pub cpu_limit: Option<String>,
    /// Run commands directly instead of through the container runtime.
    /// Only meant for tests and development machines without a runtime.
    pub use_container: bool,
    /// Hard wall-clock bound for one sandbox invocation
    pub timeout: Duration,
    /// Cap on captured stdout+stderr; overflow is a resource failure
    pub max_output_bytes: usize,
    /// Directory declared artifacts are copied to before teardown
    pub artifact_dir: PathBuf,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "registry.fedoraproject.org/fedora:latest".to_string(),
            network_disabled: true,
            memory_limit: Some("512m".to_string()),
            cpu_limit: Some("1.0".to_string()),
            use_container: true,
            timeout: Duration::from_secs(600),
            max_output_bytes: 1_048_576,
            artifact_dir: std::env::temp_dir().join("forgeci-artifacts"),
        }
    }
}

/// Retry and recovery policy for dispatched jobs.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts per (event, backend, target) key.
    /// A transient failure on the final attempt is finalized as permanent.
    pub budget: u32,
    /// A `Submitted`/`Running` descriptor not touched for this long is
    /// considered stuck and re-driven by the supervisor
    pub staleness: Duration,
    /// How often the supervisor scans for retryable and stale jobs
    pub scan_interval: Duration,
    /// Base interval between backend poll calls for one job
    pub poll_interval: Duration,
    /// Consecutive poll errors/not-found results tolerated before the poll
    /// loop gives up and leaves the job to the staleness scan
    pub poll_anomaly_budget: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            budget: 3,
            staleness: Duration::from_secs(3600),
            scan_interval: Duration::from_secs(60),
            poll_interval: Duration::from_secs(10),
            poll_anomaly_budget: 5,
        }
    }
}

/// Command template for rendering the package recipe into a submittable
/// source artifact. Executed inside the sandbox.
#[derive(Debug, Clone)]
pub struct RecipeConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Artifact path, relative to the sandbox scratch directory
    pub artifact: String,
}

impl Default for RecipeConfig {
    fn default() -> Self {
        Self {
            program: "rpmbuild".to_string(),
            args: vec![
                "-bs".to_string(),
                "--define".to_string(),
                "_srcrpmdir .".to_string(),
                "package.spec".to_string(),
            ],
            artifact: "package.src.rpm".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub listen_addr: SocketAddr,
    /// Number of concurrent worker tasks pulling from the queue
    pub workers: usize,
    /// Bounded work queue capacity; dispatch fails fast when full
    pub queue_capacity: usize,
    pub retry: RetryConfig,
    pub sandbox: SandboxConfig,
    pub recipe: RecipeConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8559"
                .parse()
                .expect("default listen address is valid"),
            workers: 4,
            queue_capacity: 1024,
            retry: RetryConfig::default(),
            sandbox: SandboxConfig::default(),
            recipe: RecipeConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.sandbox = sandbox;
        self
    }
}
