use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

use tidefetch::config::Config;
use tidefetch::humanize::format_progress;
use tidefetch::manager::validate_request;
use tidefetch::store::{ListQuery, TaskStore};
use tidefetch::task::{NetworkRequirement, NewTask, Priority, TaskRecord, TaskStatus};

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Parser, Debug)]
#[command(name = "tidefetch")]
#[command(about = "Resumable download task manager", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to $TIDEFETCH_CONFIG or config/tidefetch.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the download manager and its control API
    Serve(ServeArgs),
    /// Queue a download directly in the store (server must not be running)
    Enqueue(EnqueueArgs),
    /// Print tasks in dispatch order
    List(ListArgs),
    /// Delete completed tasks older than the retention TTL
    Purge(PurgeArgs),
    /// Upgrade the store to the current schema and print its version
    Migrate,
}

#[derive(clap::Args, Debug)]
pub struct ServeArgs {
    /// Address to bind the HTTP server to (overrides server.bind_addr)
    #[arg(long)]
    pub address: Option<SocketAddr>,
}

#[derive(clap::Args, Debug)]
pub struct EnqueueArgs {
    #[arg(long)]
    pub url: String,
    /// Directory the file is written to
    #[arg(long)]
    pub dest: PathBuf,
    #[arg(long)]
    pub file_name: String,
    /// Content this file belongs to
    #[arg(long, default_value = "")]
    pub identifier: String,
    #[arg(long, default_value = "normal")]
    pub priority: Priority,
    #[arg(long, default_value = "any")]
    pub network: NetworkRequirement,
    /// Do not start before this RFC 3339 instant
    #[arg(long)]
    pub not_before: Option<DateTime<Utc>>,
}

#[derive(clap::Args, Debug)]
pub struct ListArgs {
    #[arg(long)]
    pub status: Option<TaskStatus>,
    #[arg(long, default_value_t = 50)]
    pub limit: usize,
}

#[derive(clap::Args, Debug)]
pub struct PurgeArgs {
    /// Override retention.completed_ttl_days
    #[arg(long)]
    pub older_than_days: Option<u32>,
}

impl Cli {
    pub fn load_config(&self) -> Result<Config, AnyError> {
        let config = match &self.config {
            Some(path) => Config::load_from_path(path.clone())?,
            None => Config::load()?,
        };
        Ok(config)
    }
}

pub fn enqueue(config: &Config, args: EnqueueArgs) -> Result<(), AnyError> {
    let request = NewTask::builder()
        .source_url(args.url)
        .destination_path(args.dest)
        .file_name(args.file_name)
        .content_id(args.identifier)
        .priority(args.priority)
        .network_requirement(args.network)
        .maybe_scheduled_time(args.not_before)
        .build();
    validate_request(&request)?;

    let store = TaskStore::open(&config.server.data_dir)?;
    let task = TaskRecord::new(request, Utc::now());
    store.put(&task)?;
    store.close()?;

    println!("{}", task.id);
    Ok(())
}

pub fn list(config: &Config, args: ListArgs) -> Result<(), AnyError> {
    let store = TaskStore::open(&config.server.data_dir)?;
    let query = ListQuery {
        status: args.status,
        limit: Some(args.limit),
    };

    for task in store.list(&query)? {
        println!(
            "{}  {:<9}  {:<6}  {:<28}  {}",
            task.id,
            task.status.as_str(),
            task.priority.as_str(),
            format_progress(task.partial_bytes, task.total_bytes),
            task.destination_file().display()
        );
    }
    Ok(())
}

pub fn purge(config: &Config, args: PurgeArgs) -> Result<(), AnyError> {
    let store = TaskStore::open(&config.server.data_dir)?;
    let max_age = match args.older_than_days {
        Some(days) => chrono::Duration::days(i64::from(days)),
        None => config.retention.completed_ttl(),
    };
    let purged = store.purge_completed_older_than(max_age, Utc::now())?;
    store.close()?;

    println!("purged {purged} completed task(s)");
    Ok(())
}

pub fn migrate(config: &Config) -> Result<(), AnyError> {
    // opening runs every pending migration
    let store = TaskStore::open(&config.server.data_dir)?;
    println!("schema version {}", store.schema_version()?);
    store.close()?;
    Ok(())
}
