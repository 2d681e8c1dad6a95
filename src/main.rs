use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use swarmjob::config::NodeConfig;
use swarmjob::job::create::{add_job_dir, create_job, JobSpec};
use swarmjob::job::{Job, JobId};
use swarmjob::node::Node;
use swarmjob::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "swarmjob")]
#[command(version)]
#[command(about = "Peer-to-peer job replication and execution")]
#[command(propagate_version = true)]
struct Args {
    /// Root directory holding one subdirectory per job
    #[arg(long, short = 'r', global = true, default_value = "/tmp/swarmjob")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a node serving and working on the jobs under the root
    Run(RunArgs),

    /// Create a new job mastered by this node
    Create {
        /// Input files copied into the job
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Input file to execute once the job is replicated
        #[arg(long)]
        exec: Option<String>,

        /// Name of a file the executable produces (repeatable)
        #[arg(long = "dynamic")]
        dynamic: Vec<String>,
    },

    /// Join an existing job; a running node fetches it from its peers
    Add {
        /// The job id (64 hex characters)
        job_id: String,
    },

    /// Show replication progress of a job
    Status {
        /// The job id (64 hex characters)
        job_id: String,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Tracker host
    #[arg(long, default_value = "127.0.0.1")]
    tracker_host: String,

    /// Tracker port
    #[arg(long, default_value = "8000")]
    tracker_port: u16,

    /// Port to listen on for peer requests
    #[arg(long, short = 'p', default_value = "42069")]
    port: u16,

    /// Number of jobs worked on concurrently
    #[arg(long, short = 'w', default_value = "8")]
    workers: usize,

    /// Seconds to wait before asking the tracker again
    #[arg(long, default_value = "60")]
    retry_secs: u64,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct FileStatusOutput {
    name: String,
    size: u64,
    dynamic: bool,
    blocks_done: usize,
    blocks_total: usize,
}

#[derive(Serialize)]
struct JobStatusOutput {
    job_id: String,
    master: bool,
    execution_finished: bool,
    exec_cmd: String,
    files: Vec<FileStatusOutput>,
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn run_node(root: PathBuf, args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = NodeConfig::new(root, args.port)
        .with_tracker(args.tracker_host, args.tracker_port)
        .with_workers(args.workers)
        .with_retry_interval(Duration::from_secs(args.retry_secs));

    let shutdown = install_shutdown_handler();
    Node::new(config).run(shutdown).await?;
    Ok(())
}

fn handle_create(
    root: PathBuf,
    files: Vec<PathBuf>,
    exec: Option<String>,
    dynamic: Vec<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(&root)?;
    let spec = JobSpec {
        files,
        exec_cmd: exec,
        dynamic,
    };
    let job_id = create_job(&root, &spec)?;
    println!("{}", job_id);
    Ok(())
}

fn handle_add(root: PathBuf, job_id: String) -> Result<(), Box<dyn std::error::Error>> {
    let id = JobId::parse(&job_id)?;
    std::fs::create_dir_all(&root)?;
    let dir = add_job_dir(&root, &id)?;
    println!("Job added: {}", dir.display());
    Ok(())
}

fn handle_status(
    root: PathBuf,
    job_id: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let id = JobId::parse(&job_id)?;
    let job = Job::new(root.join(id.as_str()), id);
    if !job.manifest_path().exists() {
        println!("Job {}: waiting for manifest", job.id());
        return Ok(());
    }
    // a running node may own this directory; never write to it from here
    job.read_snapshot()?;

    let output = JobStatusOutput {
        job_id: job.id().to_string(),
        master: job.is_master(),
        execution_finished: job.is_execution_finished(),
        exec_cmd: job.exec_cmd(),
        files: job
            .progress()?
            .into_iter()
            .map(|f| FileStatusOutput {
                name: f.name,
                size: f.size,
                dynamic: f.dynamic,
                blocks_done: f.blocks_done,
                blocks_total: f.blocks_total,
            })
            .collect(),
    };

    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job ID:    {}", output.job_id);
            println!("Role:      {}", if output.master { "master" } else { "replica" });
            println!(
                "Executed:  {}",
                if output.execution_finished { "yes" } else { "no" }
            );
            if !output.exec_cmd.is_empty() {
                println!("Command:   {}", output.exec_cmd);
            }
            println!();
            println!("{:<32} {:>12} {:>10} DYNAMIC", "FILE", "SIZE", "BLOCKS");
            println!("{}", "-".repeat(64));
            for file in &output.files {
                let name = if file.name.chars().count() > 32 {
                    format!("{}...", file.name.chars().take(29).collect::<String>())
                } else {
                    file.name.clone()
                };
                println!(
                    "{:<32} {:>12} {:>10} {}",
                    name,
                    file.size,
                    format!("{}/{}", file.blocks_done, file.blocks_total),
                    if file.dynamic { "yes" } else { "-" }
                );
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
        Commands::Run(run_args) => {
            run_node(args.root, run_args).await?;
        }
        Commands::Create {
            files,
            exec,
            dynamic,
        } => {
            handle_create(args.root, files, exec, dynamic)?;
        }
        Commands::Add { job_id } => {
            handle_add(args.root, job_id)?;
        }
        Commands::Status { job_id, output } => {
            handle_status(args.root, job_id, &output)?;
        }
    }

    Ok(())
}
