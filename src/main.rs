use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tonic::transport::Channel;
use tracing_subscriber::EnvFilter;

use orca_lite::agent::Agent;
use orca_lite::config::{AgentConfig, BrokerConfig, CoordinatorConfig};
use orca_lite::coordinator::{Coordinator, FileJobStore, JobStore, MemoryJobStore};
use orca_lite::grpc::GrpcServer;
use orca_lite::proto::node_output::Outcome;
use orca_lite::proto::orchestration_client::OrchestrationClient;
use orca_lite::proto::{
    CreateJobRequest, ErrorInfo, JobRequest, JobState, ListJobsRequest, NodeState,
};
use orca_lite::shutdown::install_shutdown_handler;
use orca_lite::transport::{GrpcTransport, MemoryTransport, Transport};

#[derive(Parser, Debug)]
#[command(name = "orca-lite")]
#[command(version)]
#[command(about = "Run commands on a fleet of agents over a message bus")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a standalone message broker
    Broker(BrokerArgs),

    /// Start the coordinator and its job API
    Coordinator(CoordinatorArgs),

    /// Start an agent executing jobs on this node
    Agent(AgentArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct BrokerArgs {
    /// Address to serve the broker on
    #[arg(long, default_value = "127.0.0.1:50060")]
    listen: SocketAddr,

    /// Messages kept per destination
    #[arg(long, default_value = "100000")]
    retention: usize,
}

#[derive(Parser, Debug)]
struct CoordinatorArgs {
    /// Coordinator identity; responses are read from this destination
    #[arg(long, default_value = "coordinator")]
    id: String,

    /// Address to serve the job API on
    #[arg(long, default_value = "127.0.0.1:50061")]
    listen: SocketAddr,

    /// Remote broker URL. When omitted, a broker is served on --listen.
    #[arg(long)]
    broker: Option<String>,

    /// Messages kept per destination by the embedded broker
    #[arg(long, default_value = "100000")]
    retention: usize,

    /// Directory for job records (in memory when omitted)
    #[arg(long)]
    store_dir: Option<PathBuf>,

    /// File holding the consumed offset of the response destination
    #[arg(long)]
    offset_file: Option<PathBuf>,

    /// How long a dispatch waits for node answers
    #[arg(long, default_value = "5000")]
    dispatch_timeout_ms: u64,

    /// Job timeout used when a request does not carry one
    #[arg(long, default_value = "60000")]
    default_timeout_ms: u64,
}

#[derive(Parser, Debug)]
struct AgentArgs {
    /// Node identity; messages are read from this destination
    #[arg(long)]
    node_id: String,

    /// Broker URL
    #[arg(long, default_value = "http://127.0.0.1:50060")]
    broker: String,

    /// Directory holding job records
    #[arg(long, default_value = "/var/lib/orca/jobs")]
    root: PathBuf,

    /// File holding the consumed offset (in memory when omitted)
    #[arg(long)]
    offset_file: Option<PathBuf>,

    /// Grace period between SIGTERM and SIGKILL on cancel
    #[arg(long, default_value = "5000")]
    kill_grace_ms: u64,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Coordinator address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:50061")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Run a command on one or more nodes
    Create {
        /// Target node (repeatable)
        #[arg(long = "node", short = 'n', required = true)]
        nodes: Vec<String>,

        /// Kill the command after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// The program to run
        command: String,

        /// Arguments passed to the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        arguments: Vec<String>,
    },
    /// Refresh and show the state of a job
    Stat {
        job_id: String,
    },
    /// Show the tail of each node's output
    Tee {
        job_id: String,
    },
    /// Cancel a running job
    Cancel {
        job_id: String,
    },
    /// List all jobs
    List,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobCreateOutput {
    job_id: String,
}

#[derive(Serialize)]
struct ErrorOutput {
    code: u32,
    message: String,
}

#[derive(Serialize)]
struct NodeResultOutput {
    name: String,
    state: String,
    code: Option<i32>,
    signal: Option<String>,
    error: Option<ErrorOutput>,
}

#[derive(Serialize)]
struct JobStateOutput {
    job_id: String,
    state: String,
    nodes: Vec<NodeResultOutput>,
}

#[derive(Serialize)]
struct NodeOutputItem {
    node: String,
    output: Option<String>,
    error: Option<ErrorOutput>,
}

#[derive(Serialize)]
struct TeeOutput {
    job_id: String,
    outputs: Vec<NodeOutputItem>,
}

#[derive(Serialize)]
struct JobListItem {
    job_id: String,
    state: String,
    command: String,
    nodes: Vec<String>,
    created_at_ms: i64,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn job_state_to_string(state: i32) -> String {
    match JobState::try_from(state) {
        Ok(JobState::Running) => "RUNNING".to_string(),
        Ok(JobState::Cancelling) => "CANCELLING".to_string(),
        Ok(JobState::Cancelled) => "CANCELLED".to_string(),
        Ok(JobState::Done) => "DONE".to_string(),
        _ => "UNKNOWN".to_string(),
    }
}

fn node_state_to_string(state: i32) -> String {
    match NodeState::try_from(state) {
        Ok(NodeState::Running) => "RUNNING".to_string(),
        Ok(NodeState::Exited) => "EXITED".to_string(),
        Ok(NodeState::Killed) => "KILLED".to_string(),
        Ok(NodeState::Timeout) => "TIMEOUT".to_string(),
        Ok(NodeState::Cancelled) => "CANCELLED".to_string(),
        Ok(NodeState::Failed) => "FAILED".to_string(),
        _ => "UNKNOWN".to_string(),
    }
}

fn error_output(error: ErrorInfo) -> ErrorOutput {
    ErrorOutput {
        code: error.code,
        message: error.message,
    }
}

async fn create_client_channel(addr: &str) -> Result<Channel, Box<dyn std::error::Error>> {
    Ok(Channel::from_shared(addr.to_string())?.connect().await?)
}

// =============================================================================
// Server Implementations
// =============================================================================

async fn run_broker(args: BrokerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let config = BrokerConfig::new(args.listen).with_retention(args.retention);
    let shutdown = install_shutdown_handler()?;

    tracing::info!(listen_addr = %config.listen_addr, "Starting orca-lite broker");
    GrpcServer::new(config.listen_addr)
        .with_broker(MemoryTransport::with_retention(config.retention))
        .run(shutdown)
        .await?;
    Ok(())
}

async fn run_coordinator(args: CoordinatorArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mut config = CoordinatorConfig::new(args.id, args.listen)
        .with_dispatch_timeout_ms(args.dispatch_timeout_ms)
        .with_default_job_timeout_ms(args.default_timeout_ms);
    if let Some(dir) = args.store_dir {
        config = config.with_store_dir(dir);
    }
    if let Some(path) = args.offset_file {
        config = config.with_offset_file(path);
    }

    let shutdown = install_shutdown_handler()?;

    // Without --broker the coordinator serves the message log itself
    let retention = args.retention;
    let embedded = args
        .broker
        .is_none()
        .then(|| MemoryTransport::with_retention(retention));
    let transport: Arc<dyn Transport> = match &args.broker {
        Some(url) => Arc::new(GrpcTransport::connect(url).await?),
        None => Arc::new(
            embedded
                .clone()
                .unwrap_or_else(|| MemoryTransport::with_retention(retention)),
        ),
    };
    let store: Arc<dyn JobStore> = match &config.store_dir {
        Some(dir) => Arc::new(FileJobStore::open(dir).await?),
        None => Arc::new(MemoryJobStore::new()),
    };

    tracing::info!(
        id = %config.id,
        listen_addr = %config.listen_addr,
        broker = args.broker.as_deref().unwrap_or("embedded"),
        store_dir = ?config.store_dir,
        "Starting orca-lite coordinator"
    );

    let listen_addr = config.listen_addr;
    let coordinator = Arc::new(Coordinator::new(config, transport, store));
    let consumer = tokio::spawn(coordinator.clone().run(shutdown.clone()));

    let mut server = GrpcServer::new(listen_addr).with_orchestration(coordinator);
    if let Some(log) = embedded {
        server = server.with_broker(log);
    }
    server.run(shutdown).await?;
    consumer.await??;

    Ok(())
}

async fn run_agent(args: AgentArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mut config = AgentConfig::new(args.node_id, args.root).with_kill_grace_ms(args.kill_grace_ms);
    if let Some(path) = args.offset_file {
        config = config.with_offset_file(path);
    }

    let shutdown = install_shutdown_handler()?;
    let transport = Arc::new(GrpcTransport::connect(&args.broker).await?);

    tracing::info!(
        node = %config.node_id,
        broker = %args.broker,
        root = %config.root.display(),
        "Starting orca-lite agent"
    );

    Arc::new(Agent::new(config, transport)).run(shutdown).await?;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_job_create(
    client: &mut OrchestrationClient<Channel>,
    request: CreateJobRequest,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = match client.create_job(request).await {
        Ok(response) => response.into_inner(),
        Err(status) => {
            eprintln!("Error: Job creation failed: {}", status.message());
            std::process::exit(1);
        }
    };

    match output_format {
        OutputFormat::Json => {
            let output = JobCreateOutput {
                job_id: response.job_id,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job created successfully!");
            println!("Job ID: {}", response.job_id);
        }
    }
    Ok(())
}

async fn handle_job_stat(
    client: &mut OrchestrationClient<Channel>,
    job_id: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client.stat_job(JobRequest { job_id }).await?.into_inner();

    let output = JobStateOutput {
        job_id: response.job_id,
        state: job_state_to_string(response.state),
        nodes: response
            .nodes
            .into_iter()
            .map(|n| NodeResultOutput {
                name: n.name,
                state: node_state_to_string(n.state),
                code: n.code,
                signal: n.signal,
                error: n.error.map(error_output),
            })
            .collect(),
    };

    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job ID: {}", output.job_id);
            println!("State:  {}", output.state);
            if !output.nodes.is_empty() {
                println!();
                println!("{:<20} {:<10} {:<6} {:<8} ERROR", "NODE", "STATE", "CODE", "SIGNAL");
                println!("{}", "-".repeat(70));
                for node in &output.nodes {
                    println!(
                        "{:<20} {:<10} {:<6} {:<8} {}",
                        node.name,
                        node.state,
                        node.code.map(|c| c.to_string()).unwrap_or_else(|| "-".into()),
                        node.signal.as_deref().unwrap_or("-"),
                        node.error
                            .as_ref()
                            .map(|e| format!("[{}] {}", e.code, e.message))
                            .unwrap_or_default(),
                    );
                }
            }
        }
    }
    Ok(())
}

async fn handle_job_tee(
    client: &mut OrchestrationClient<Channel>,
    job_id: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client.tee_job(JobRequest { job_id }).await?.into_inner();

    let outputs: Vec<NodeOutputItem> = response
        .outputs
        .into_iter()
        .map(|o| match o.outcome {
            Some(Outcome::Output(output)) => NodeOutputItem {
                node: o.node,
                output: Some(output),
                error: None,
            },
            Some(Outcome::Error(error)) => NodeOutputItem {
                node: o.node,
                output: None,
                error: Some(error_output(error)),
            },
            None => NodeOutputItem {
                node: o.node,
                output: None,
                error: None,
            },
        })
        .collect();

    match output_format {
        OutputFormat::Json => {
            let output = TeeOutput {
                job_id: response.job_id,
                outputs,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            for item in outputs {
                println!("== {} ==", item.node);
                if let Some(error) = item.error {
                    println!("Error: [{}] {}", error.code, error.message);
                }
                if let Some(output) = item.output {
                    for line in output.lines() {
                        println!("  {}", line);
                    }
                }
            }
        }
    }
    Ok(())
}

async fn handle_job_cancel(
    client: &mut OrchestrationClient<Channel>,
    job_id: String,
) -> Result<(), Box<dyn std::error::Error>> {
    match client.cancel_job(JobRequest { job_id: job_id.clone() }).await {
        Ok(_) => {
            println!("Job {} is being cancelled", job_id);
            Ok(())
        }
        Err(status) => {
            eprintln!("Error: {}", status.message());
            std::process::exit(1);
        }
    }
}

async fn handle_job_list(
    client: &mut OrchestrationClient<Channel>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client.list_jobs(ListJobsRequest {}).await?.into_inner();
    let jobs: Vec<JobListItem> = response
        .jobs
        .into_iter()
        .map(|job| JobListItem {
            job_id: job.job_id,
            state: job_state_to_string(job.state),
            command: std::iter::once(job.command)
                .chain(job.arguments)
                .collect::<Vec<_>>()
                .join(" "),
            nodes: job.nodes,
            created_at_ms: job.created_at_ms,
        })
        .collect();

    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&jobs)?);
        }
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found.");
            } else {
                println!("{:<38} {:<12} {:<6} COMMAND", "JOB ID", "STATE", "NODES");
                println!("{}", "-".repeat(78));
                for job in &jobs {
                    let cmd_display = if job.command.chars().count() > 20 {
                        format!("{}...", job.command.chars().take(17).collect::<String>())
                    } else {
                        job.command.clone()
                    };
                    println!(
                        "{:<38} {:<12} {:<6} {}",
                        job.job_id,
                        job.state,
                        job.nodes.len(),
                        cmd_display
                    );
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Broker(broker_args) => run_broker(broker_args).await?,
        Commands::Coordinator(coordinator_args) => run_coordinator(coordinator_args).await?,
        Commands::Agent(agent_args) => run_agent(agent_args).await?,
        Commands::Job { client, command } => {
            let channel = create_client_channel(&client.addr).await?;
            let mut grpc_client = OrchestrationClient::new(channel);

            match command {
                JobCommands::Create {
                    nodes,
                    timeout_ms,
                    command,
                    arguments,
                } => {
                    let request = CreateJobRequest {
                        command,
                        arguments,
                        nodes,
                        timeout_ms: timeout_ms.unwrap_or(0),
                    };
                    handle_job_create(&mut grpc_client, request, &client.output).await?;
                }
                JobCommands::Stat { job_id } => {
                    handle_job_stat(&mut grpc_client, job_id, &client.output).await?;
                }
                JobCommands::Tee { job_id } => {
                    handle_job_tee(&mut grpc_client, job_id, &client.output).await?;
                }
                JobCommands::Cancel { job_id } => {
                    handle_job_cancel(&mut grpc_client, job_id).await?;
                }
                JobCommands::List => {
                    handle_job_list(&mut grpc_client, &client.output).await?;
                }
            }
        }
    }

    Ok(())
}
