//! studio-ops CLI: operator interface to the studio operations worker.

use chrono::Utc;
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use std::path::PathBuf;
use std::sync::Arc;

use studio_ops::config::{Config, load_folder_policy};
use studio_ops::db::Db;
use studio_ops::engine::{HandlerRegistry, Worker, WorkerConfig};
use studio_ops::fs::LocalFs;
use studio_ops::integrity::RootIntegrityChecker;
use studio_ops::model::job::{Job, JobId, JobPayload, JobStatus, NewJob};
use studio_ops::model::provisioning::ProvisioningRequest;
use studio_ops::provisioning::Provisioner;
use studio_ops::queue::{EnqueueResult, JobFilter, JobQueue};
use studio_ops::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "studio-ops", about = "Studio folder provisioning, root integrity and job worker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the job worker daemon
    Serve,
    /// Job queue operations
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },
    /// Run a provisioning request locally, without the database
    Provision {
        /// JSON provisioning request
        #[arg(long)]
        request: PathBuf,
    },
}

#[derive(Subcommand)]
enum JobsAction {
    /// Enqueue a job
    Enqueue {
        /// Job type key (project_bootstrap, project_archive, root_integrity, delivery, delivery_email)
        job_type: String,
        /// JSON payload, or @path to read it from a file
        payload: String,
    },
    /// List jobs
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
        /// Filter by job type key
        #[arg(long = "type")]
        job_type: Option<String>,
        /// Maximum jobs to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show a job
    Show {
        /// Job ID (full UUID or prefix)
        id: String,
    },
    /// Move a failed job back to the queue
    Reset {
        /// Job ID (full UUID or prefix)
        id: String,
    },
    /// Count running jobs whose claim has expired
    Stale {
        /// Requeue them instead of only counting
        #[arg(long)]
        requeue: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve => cmd_serve().await,
        Command::Provision { request } => cmd_provision(request).await,
        Command::Jobs { action } => {
            let config = Config::from_env()?;
            let db = Db::connect(config.database_url.expose_secret()).await?;
            db.migrate().await?;
            let queue = JobQueue::new(Arc::new(db), config.queue_config()?);

            match action {
                JobsAction::Enqueue { job_type, payload } => {
                    cmd_jobs_enqueue(&queue, &job_type, &payload).await
                }
                JobsAction::List {
                    status,
                    job_type,
                    limit,
                } => cmd_jobs_list(&queue, status, job_type, limit).await,
                JobsAction::Show { id } => cmd_jobs_show(&queue, &id).await,
                JobsAction::Reset { id } => {
                    let id = resolve_id(&queue, &id).await?;
                    let job = queue.reset(id, Utc::now()).await?;
                    println!("Reset: {} (status: {})", job.id, job.status);
                    Ok(())
                }
                JobsAction::Stale { requeue } => {
                    let now = Utc::now();
                    if requeue {
                        let ids = queue.requeue_stale(now).await?;
                        println!("Requeued {} stale job(s)", ids.len());
                        for id in ids {
                            println!("  {id}");
                        }
                    } else {
                        println!("{} stale job(s)", queue.stale_count(now).await?);
                    }
                    Ok(())
                }
            }
        }
    }
}

async fn cmd_serve() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "studio-ops".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let db = Arc::new(Db::connect(config.database_url.expose_secret()).await?);
    db.migrate().await?;

    let fs = Arc::new(LocalFs::new());
    let provisioner = Provisioner::new(fs.clone(), config.folder_policy()?);
    let integrity = RootIntegrityChecker::new(
        db.clone(),
        db.clone(),
        fs,
        config.worker_id.clone(),
    );
    let queue = JobQueue::new(db.clone(), config.queue_config()?);

    let worker = Worker::new(
        queue,
        db,
        provisioner,
        integrity,
        Arc::new(HandlerRegistry::empty()),
        WorkerConfig {
            worker_id: config.worker_id.clone(),
            poll_interval: config.poll_interval,
            stale_sweep_interval: config.stale_sweep_interval,
        },
    );

    let w = worker.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        w.shutdown();
    });

    worker.run().await?;
    Ok(())
}

async fn cmd_provision(request_path: PathBuf) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: None,
        service_name: "studio-ops".to_string(),
        log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "warn".to_string()),
    })?;

    let content = std::fs::read_to_string(&request_path)?;
    let request: ProvisioningRequest = serde_json::from_str(&content)?;
    let policy_path = std::env::var("FOLDER_POLICY_PATH").ok().map(PathBuf::from);
    let policy = load_folder_policy(policy_path.as_deref())?;

    let provisioner = Provisioner::new(Arc::new(LocalFs::new()), policy);
    let result = tokio::task::spawn_blocking(move || provisioner.run(&request)).await??;

    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.success() {
        anyhow::bail!("{}", result.summary());
    }
    Ok(())
}

async fn cmd_jobs_enqueue(queue: &JobQueue, job_type: &str, payload: &str) -> anyhow::Result<()> {
    let json = match payload.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)?,
        None => payload.to_string(),
    };
    let value: serde_json::Value = serde_json::from_str(&json)?;
    let payload = JobPayload::decode(job_type, &value)?;

    match queue.enqueue(NewJob::new(&payload)?).await? {
        EnqueueResult::Enqueued(job) => {
            println!("Enqueued: {} (status: {})", job.id, job.status);
        }
        EnqueueResult::NotEnqueued { reason, .. } => {
            println!("Not enqueued: {reason}");
        }
    }
    Ok(())
}

async fn cmd_jobs_list(
    queue: &JobQueue,
    status: Option<String>,
    job_type: Option<String>,
    limit: usize,
) -> anyhow::Result<()> {
    let status: Option<JobStatus> = match status {
        Some(s) => Some(s.parse().map_err(|_| anyhow::anyhow!("invalid status: {s}"))?),
        None => None,
    };

    let jobs = queue
        .list(&JobFilter {
            status,
            job_type_key: job_type,
            limit: Some(limit),
            ..JobFilter::default()
        })
        .await?;

    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<18}  {:<10}  {:<7}  {:<30}  CREATED",
        "ID", "TYPE", "STATUS", "TRIES", "ENTITY"
    );
    println!("{}", "-".repeat(100));

    for job in &jobs {
        let short_id = &job.id.to_string()[..8];
        let entity = format!("{}:{}", job.entity_type_key, job.entity_key);
        let entity_display: String = entity.chars().take(30).collect();
        println!(
            "{:<8}  {:<18}  {:<10}  {:<7}  {:<30}  {}",
            short_id,
            job.job_type_key,
            job.status,
            format!("{}/{}", job.attempt_count, job.max_attempts),
            entity_display,
            job.created_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!("\n{} job(s)", jobs.len());
    Ok(())
}

async fn cmd_jobs_show(queue: &JobQueue, id: &str) -> anyhow::Result<()> {
    let id = resolve_id(queue, id).await?;
    let job = queue.get(id).await?;
    print_job(&job)
}

fn print_job(job: &Job) -> anyhow::Result<()> {
    println!("ID:          {}", job.id);
    println!("Type:        {}", job.job_type_key);
    println!("Status:      {}", job.status);
    println!("Entity:      {}:{}", job.entity_type_key, job.entity_key);
    println!("Attempts:    {}/{}", job.attempt_count, job.max_attempts);
    println!("Run After:   {}", job.run_after);
    if let Some(until) = job.locked_until {
        println!(
            "Locked:      until {until} by {}",
            job.locked_by.as_deref().unwrap_or("-")
        );
    }
    println!(
        "Payload:     {}",
        serde_json::to_string_pretty(&job.payload_json)?
    );
    println!("Created:     {}", job.created_at);
    println!("Updated:     {}", job.updated_at);
    if let Some(completed) = job.completed_at {
        println!("Completed:   {completed}");
    }
    if let Some(ref err) = job.last_error {
        println!("Last Error:  {err}");
    }
    if let Some(ref result) = job.result_json {
        println!("---");
        println!("Result:      {}", serde_json::to_string_pretty(result)?);
    }
    Ok(())
}

/// Accept a full UUID or a unique prefix of a recent job's ID.
async fn resolve_id(queue: &JobQueue, id: &str) -> anyhow::Result<JobId> {
    if id.len() >= 36 {
        return Ok(JobId(uuid::Uuid::parse_str(id)?));
    }
    let jobs = queue
        .list(&JobFilter {
            limit: Some(500),
            ..JobFilter::default()
        })
        .await?;
    let matches: Vec<_> = jobs
        .iter()
        .filter(|job| job.id.to_string().starts_with(id))
        .collect();
    match matches.len() {
        0 => anyhow::bail!("no job matching prefix '{id}'"),
        1 => Ok(matches[0].id),
        n => anyhow::bail!("{n} jobs match prefix '{id}', be more specific"),
    }
}
