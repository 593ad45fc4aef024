use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use pr_simulator::config::{
    CheckoutConfig, ExecutorConfig, PlannerConfig, QueueConfig, SandboxConfig, ServiceConfig,
    StoreConfig, WatchdogConfig, WorkerConfig,
};
use pr_simulator::gateway::{JobView, SubmissionGateway};
use pr_simulator::service::{open_backends, Service};
use pr_simulator::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "pr-simulator")]
#[command(version)]
#[command(about = "Asynchronous pull request simulation service")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the worker pool, watchdog and (optionally) the HTTP API
    Serve(ServeArgs),

    /// Job management commands against a local database
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },
}

// =============================================================================
// Serve Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServeArgs {
    /// SQLite database holding jobs and the queue
    #[arg(long, env = "PR_SIMULATOR_DB", default_value = "pr-simulator.db")]
    database: PathBuf,

    /// Keep jobs and the queue in memory (lost on exit)
    #[arg(long)]
    ephemeral: bool,

    /// Port for the HTTP API (not served when omitted)
    #[arg(long, env = "PR_SIMULATOR_API_PORT")]
    api_port: Option<u16>,

    /// Number of concurrent workers
    #[arg(long, default_value = "2")]
    workers: usize,

    /// Visibility timeout for dequeued messages, in milliseconds
    #[arg(long, default_value = "900000")]
    visibility_timeout_ms: u64,

    /// Deliveries before a message is dead-lettered
    #[arg(long, default_value = "3")]
    max_deliveries: u32,

    /// Age after which a non-terminal job is considered stuck, in milliseconds
    #[arg(long, default_value = "1800000")]
    stale_after_ms: u64,

    /// Directory for per-job working copies
    #[arg(long, env = "PR_SIMULATOR_WORKSPACE")]
    workspace_root: Option<PathBuf>,

    /// GitHub token used for the API and for cloning
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    github_token: Option<String>,

    /// GitHub API base URL
    #[arg(long, env = "GITHUB_API_URL", default_value = "https://api.github.com")]
    github_api: String,

    /// Base URL of the application under test
    #[arg(long, default_value = "http://localhost:3000")]
    app_url: String,

    /// Command that starts the application from the workspace (run in a sandbox)
    #[arg(long)]
    launch_command: Option<String>,

    /// Port the launched application listens on
    #[arg(long, default_value = "3000")]
    app_port: u16,

    /// Docker image for sandboxed commands
    #[arg(long, default_value = "node:20-alpine")]
    image: String,

    /// Check command added to every plan (repeatable)
    #[arg(long = "check")]
    checks: Vec<String>,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// SQLite database shared with `serve`
    #[arg(long, env = "PR_SIMULATOR_DB", default_value = "pr-simulator.db")]
    database: PathBuf,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a pull request for simulation
    Submit {
        /// Pull request URL (https://github.com/owner/repo/pull/123)
        pr_url: String,

        /// Submitting user
        #[arg(long, short = 'u', env = "PR_SIMULATOR_USER")]
        user: String,
    },
    /// Show a job and its report
    Status {
        /// The job ID (UUID)
        job_id: String,

        #[arg(long, short = 'u', env = "PR_SIMULATOR_USER")]
        user: String,
    },
    /// List a user's jobs, newest first
    List {
        #[arg(long, short = 'u', env = "PR_SIMULATOR_USER")]
        user: String,

        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobSubmitOutput {
    job_id: String,
    status: String,
}

// =============================================================================
// Serve Implementation
// =============================================================================

fn service_config(args: ServeArgs) -> ServiceConfig {
    let defaults = CheckoutConfig::default();
    ServiceConfig {
        queue: QueueConfig {
            visibility_timeout_ms: args.visibility_timeout_ms,
            max_deliveries: args.max_deliveries,
        },
        store: StoreConfig {
            database_path: (!args.ephemeral).then_some(args.database),
            ..StoreConfig::default()
        },
        worker: WorkerConfig {
            worker_count: args.workers,
            ..WorkerConfig::default()
        },
        watchdog: WatchdogConfig {
            stale_after_ms: args.stale_after_ms,
            ..WatchdogConfig::default()
        },
        checkout: CheckoutConfig {
            workspace_root: args.workspace_root.unwrap_or(defaults.workspace_root),
            github_api_base: args.github_api,
            github_token: args.github_token,
            ..defaults
        },
        planner: PlannerConfig {
            check_commands: args.checks,
            ..PlannerConfig::default()
        },
        executor: ExecutorConfig {
            app_base_url: args.app_url,
            launch_command: args.launch_command,
            app_port: args.app_port,
            sandbox: SandboxConfig {
                image: args.image,
                ..SandboxConfig::default()
            },
            ..ExecutorConfig::default()
        },
        api_addr: args
            .api_port
            .map(|port| SocketAddr::from(([0, 0, 0, 0], port))),
    }
}

async fn run_serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = service_config(args);
    tracing::info!(
        workers = config.worker.worker_count,
        database = ?config.store.database_path,
        api_addr = ?config.api_addr,
        max_deliveries = config.queue.max_deliveries,
        "Starting pr-simulator"
    );

    let service = Service::open(config)?;
    let shutdown = install_shutdown_handler();
    service.run(shutdown).await?;
    Ok(())
}

// =============================================================================
// Job Command Handlers
// =============================================================================

fn print_job_table(view: &JobView) {
    println!("Job ID:       {}", view.job_id);
    println!("PR:           {}", view.pr_url);
    println!("Status:       {}", view.status.as_str().to_uppercase());
    println!("Attempts:     {}", view.attempt_count);
    println!("Created:      {}", view.created_at.to_rfc3339());
    if let Some(completed_at) = view.completed_at {
        println!("Completed:    {}", completed_at.to_rfc3339());
    }
    let Some(report) = &view.report else {
        if !view.is_terminal {
            println!();
            println!("Simulation still in progress.");
        }
        return;
    };
    println!("Result:       {}", report.result.to_string().to_uppercase());
    println!("Summary:      {}", report.summary);
    if let Some(stats) = &report.diff_stats {
        println!(
            "Diff:         {} files ({} relevant), +{} -{}",
            stats.files_changed, stats.relevant_files, stats.lines_added, stats.lines_removed
        );
    }
    if !report.steps.is_empty() {
        println!();
        println!("{:<4} {:<20} {:<8} DESCRIPTION", "#", "STEP", "RESULT");
        println!("{}", "-".repeat(70));
        for step in &report.steps {
            println!(
                "{:<4} {:<20} {:<8} {}",
                step.index,
                step.step_id,
                step.status.to_string().to_uppercase(),
                step.description
            );
            if let Some(detail) = &step.detail {
                for line in detail.lines() {
                    println!("     {}", line);
                }
            }
        }
    }
}

async fn handle_job_command(
    gateway: SubmissionGateway,
    command: JobCommands,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        JobCommands::Submit { pr_url, user } => {
            let job = gateway.submit(&user, &pr_url).await?;
            match output_format {
                OutputFormat::Json => {
                    let output = JobSubmitOutput {
                        job_id: job.job_id.to_string(),
                        status: job.status.to_string(),
                    };
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                OutputFormat::Table => {
                    println!("Simulation submitted successfully!");
                    println!("Job ID: {}", job.job_id);
                }
            }
        }
        JobCommands::Status { job_id, user } => {
            let job_id = Uuid::parse_str(&job_id).map_err(|_| format!("invalid job id '{}'", job_id))?;
            let view = gateway.report(job_id, &user).await?;
            match output_format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&view)?),
                OutputFormat::Table => print_job_table(&view),
            }
        }
        JobCommands::List { user, limit } => {
            let jobs = gateway.list(&user, limit).await?;
            match output_format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&jobs)?),
                OutputFormat::Table => {
                    if jobs.is_empty() {
                        println!("No jobs found.");
                        return Ok(());
                    }
                    println!("{:<38} {:<10} {:<6} PR", "JOB ID", "STATUS", "RESULT");
                    println!("{}", "-".repeat(90));
                    for job in &jobs {
                        let result = job
                            .report
                            .as_ref()
                            .map(|r| r.result.to_string())
                            .unwrap_or_else(|| "-".to_string());
                        println!(
                            "{:<38} {:<10} {:<6} {}",
                            job.job_id,
                            job.status.as_str().to_uppercase(),
                            result.to_uppercase(),
                            job.pr_url
                        );
                    }
                    println!();
                    println!("Showing {} jobs", jobs.len());
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Serve(serve_args) => run_serve(serve_args).await,
        Commands::Job { client, command } => {
            let store = StoreConfig {
                database_path: Some(client.database.clone()),
                ..StoreConfig::default()
            };
            // only enqueues; delivery settings belong to `serve`
            let (store, queue) = open_backends(&store, &QueueConfig::default())?;
            let gateway = SubmissionGateway::new(store, queue);
            handle_job_command(gateway, command, &client.output).await
        }
    }
}
