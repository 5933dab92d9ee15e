use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use hostsync::audit::ExecutionFilter;
use hostsync::config::{AppConfig, LogFormat, LoggingConfig};
use hostsync::inventory::Inventory;
use hostsync::source::{
    absent_addresses, HttpSourceFactory, SourceFactory, SourceKind, SourceParams, TimeRange,
};
use hostsync::sync::targets::dedup_hosts;
use hostsync::sync::{RunRequest, RunResult, Selection};
use hostsync::tasks::{NewTask, SyncTaskDefinition, TaskFilter, TaskUpdate};

#[derive(Parser)]
#[command(
    name = "hostsync",
    about = "Host pool inventory with scheduled utilization sync from metrics sources",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (default: $HOSTSYNC_CONFIG, then /etc/hostsync/hostsync.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// JSON output for machine parsing
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + task scheduler)
    Serve {
        /// Bind address (overrides [server].bind)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run a sync now
    Sync {
        #[command(subcommand)]
        target: SyncTarget,
    },

    /// Manage recurring sync tasks
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },

    /// Inspect sync executions
    Executions {
        #[command(subcommand)]
        action: ExecutionAction,
    },

    /// Inspect the host pool
    Hosts {
        #[command(subcommand)]
        action: HostAction,
    },

    /// Query a metrics source directly
    Source {
        #[command(subcommand)]
        action: SourceAction,
    },

    /// Manage location rules
    Location {
        #[command(subcommand)]
        action: LocationAction,
    },
}

#[derive(Args)]
struct ParamArgs {
    /// Override the source endpoint
    #[arg(long)]
    endpoint: Option<String>,

    /// Override the index pattern (elasticsearch)
    #[arg(long)]
    index_pattern: Option<String>,

    /// Lookback window in minutes
    #[arg(long)]
    time_range: Option<i64>,

    /// Free-form filter passed to the CMSYS API
    #[arg(long)]
    query: Option<String>,
}

impl ParamArgs {
    fn is_empty(&self) -> bool {
        self.endpoint.is_none()
            && self.index_pattern.is_none()
            && self.time_range.is_none()
            && self.query.is_none()
    }

    fn to_params(&self) -> SourceParams {
        SourceParams {
            endpoint: self.endpoint.clone(),
            index_pattern: self.index_pattern.clone(),
            time_range_minutes: self.time_range,
            query: self.query.clone(),
        }
    }
}

#[derive(Args)]
struct SourceArgs {
    /// Metrics source: elasticsearch (es) or cmsys
    #[arg(long)]
    source: SourceKind,

    #[command(flatten)]
    params: ParamArgs,
}

#[derive(Args)]
struct SelectionArgs {
    /// Explicit host addresses, comma separated
    #[arg(long, value_delimiter = ',')]
    hosts: Vec<String>,

    /// Host list file, read at each run
    #[arg(long)]
    file: Option<String>,

    /// Group name for a full sync
    #[arg(long)]
    group: Option<String>,
}

impl SelectionArgs {
    fn selection(&self) -> Result<Option<Selection>> {
        let mut chosen = Vec::new();
        if !self.hosts.is_empty() {
            chosen.push(Selection::Hosts {
                hosts: self.hosts.clone(),
            });
        }
        if let Some(path) = &self.file {
            chosen.push(Selection::File { path: path.clone() });
        }
        if let Some(group) = &self.group {
            chosen.push(Selection::Group {
                group: group.clone(),
            });
        }
        if chosen.len() > 1 {
            anyhow::bail!("use only one of --hosts, --file or --group");
        }
        Ok(chosen.pop())
    }
}

#[derive(Subcommand)]
enum SyncTarget {
    /// Sync an explicit list of addresses
    Hosts {
        #[command(flatten)]
        src: SourceArgs,

        #[arg(required = true)]
        hosts: Vec<String>,
    },

    /// Sync the addresses listed in a file (one per line)
    File {
        #[command(flatten)]
        src: SourceArgs,

        path: PathBuf,
    },

    /// Sync every host the source reports for a group
    Group {
        #[command(flatten)]
        src: SourceArgs,

        group: String,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// List tasks
    List {
        #[arg(long)]
        source: Option<SourceKind>,

        #[arg(long)]
        enabled_only: bool,
    },

    /// Show one task
    Show { id: i64 },

    /// Add a task
    Add {
        /// Unique task name
        #[arg(long)]
        name: String,

        /// Cron expression (6-field, with seconds)
        #[arg(long)]
        cron: String,

        #[command(flatten)]
        src: SourceArgs,

        #[command(flatten)]
        selection: SelectionArgs,

        #[arg(long, default_value = "")]
        description: String,

        #[arg(long, default_value = "")]
        created_by: String,

        /// Create the task disabled
        #[arg(long)]
        disabled: bool,
    },

    /// Change a task; unset options keep their value
    Update {
        id: i64,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        cron: Option<String>,

        #[arg(long)]
        source: Option<SourceKind>,

        #[arg(long)]
        description: Option<String>,

        #[command(flatten)]
        selection: SelectionArgs,

        #[command(flatten)]
        params: ParamArgs,
    },

    /// Enable a task
    Enable { id: i64 },

    /// Disable a task
    Disable { id: i64 },

    /// Delete a task (kept in history)
    Delete { id: i64 },

    /// Preview what will run in the next N hours
    DryRun {
        #[arg(long, default_value = "24")]
        hours: u64,
    },
}

#[derive(Subcommand)]
enum ExecutionAction {
    /// List executions, most recent first
    List {
        #[arg(long)]
        task_id: Option<i64>,

        #[arg(long)]
        source: Option<SourceKind>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show an execution and its per-host details
    Show { id: String },
}

#[derive(Subcommand)]
enum HostAction {
    /// Show a host and its current metrics
    Show { address: String },
}

#[derive(Subcommand)]
enum SourceAction {
    /// Report which addresses the source has data for
    Check {
        #[command(flatten)]
        src: SourceArgs,

        #[arg(required = true)]
        hosts: Vec<String>,
    },
}

#[derive(Subcommand)]
enum LocationAction {
    /// Add or update a location rule
    Add {
        #[arg(long)]
        name: String,

        /// Exact address, glob (10.1.*) or CIDR (10.0.0.0/8)
        #[arg(long)]
        pattern: String,

        /// Lower values are matched first
        #[arg(long, default_value = "0")]
        priority: i64,
    },

    /// List location rules in match order
    List,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let json = cli.json;
    let mut config = AppConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "Starting hostsync daemon");
            hostsync::serve(config).await?;
        }
        Commands::Sync { target } => run_sync(&config, target, json).await?,
        Commands::Task { action } => run_task(&config, action, json).await?,
        Commands::Executions { action } => run_executions(&config, action, json)?,
        Commands::Hosts { action } => run_hosts(&config, action, json)?,
        Commands::Source { action } => run_source(&config, action, json).await?,
        Commands::Location { action } => run_location(&config, action, json)?,
    }

    Ok(())
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_sync(config: &AppConfig, target: SyncTarget, json: bool) -> Result<()> {
    let pool = hostsync::open_database(config)?;
    let engine = hostsync::build_engine(config, pool);

    let (src, selection) = match target {
        SyncTarget::Hosts { src, hosts } => (src, Selection::Hosts { hosts }),
        SyncTarget::File { src, path } => (
            src,
            Selection::File {
                path: path.display().to_string(),
            },
        ),
        SyncTarget::Group { src, group } => (src, Selection::Group { group }),
    };
    tracing::info!(source = %src.source, mode = selection.mode(), "Running sync");

    let request = RunRequest::ad_hoc(src.source, selection).with_params(src.params.to_params());
    let result = engine.run_detached(request).await?;

    if json {
        return print_json(&result);
    }
    print_run_result(&result);
    Ok(())
}

fn print_run_result(r: &RunResult) {
    println!("\n=== Sync {} ===", r.execution_id);
    println!("Source:        {}", r.source);
    println!("Status:        {}", r.status);
    println!("Duration:      {} ms", r.duration_ms);
    println!(
        "Hosts:         {} total, {} succeeded, {} failed, {} not in source",
        r.total, r.succeeded, r.failed, r.not_in_source
    );
    if let Some(msg) = &r.message {
        println!("Message:       {}", msg);
    }
    if !r.new_hosts.is_empty() || !r.updated_hosts.is_empty() {
        println!(
            "Pool:          {} new, {} updated",
            r.new_hosts.len(),
            r.updated_hosts.len()
        );
    }
    if !r.succeeded_hosts.is_empty() {
        println!("\nSucceeded:");
        for h in &r.succeeded_hosts {
            println!(" - {}", h);
        }
    }
    if !r.failed_hosts.is_empty() {
        println!("\nFailed:");
        for f in &r.failed_hosts {
            println!(" - {}: {}", f.address, f.error);
        }
    }
    if !r.not_in_source_hosts.is_empty() {
        println!("\nNot in source:");
        for h in &r.not_in_source_hosts {
            println!(" - {}", h);
        }
    }
    println!();
}

fn print_tasks(tasks: &[SyncTaskDefinition]) {
    if tasks.is_empty() {
        println!("No tasks found.");
        return;
    }
    println!(
        "{:<5} | {:<20} | {:<13} | {:<16} | {:<6} | Enabled",
        "ID", "Name", "Source", "Cron", "Mode"
    );
    println!("{:-<5}-|-{:-<20}-|-{:-<13}-|-{:-<16}-|-{:-<6}-|-{:-<7}", "", "", "", "", "", "");
    for t in tasks {
        println!(
            "{:<5} | {:<20} | {:<13} | {:<16} | {:<6} | {}",
            t.id,
            t.name,
            t.source_kind.as_str(),
            t.cron_expr,
            t.selection.mode(),
            t.enabled
        );
    }
}

async fn run_task(config: &AppConfig, action: TaskAction, json: bool) -> Result<()> {
    let pool = hostsync::open_database(config)?;
    let engine = hostsync::build_engine(config, pool.clone());
    let tasks = hostsync::build_task_service(engine, pool);

    match action {
        TaskAction::List {
            source,
            enabled_only,
        } => {
            let list = tasks
                .list(TaskFilter {
                    source_kind: source,
                    enabled_only,
                })
                .await?;
            if json {
                print_json(&list)?;
            } else {
                print_tasks(&list);
            }
        }
        TaskAction::Show { id } => {
            let task = tasks.get(id).await?;
            print_json(&task)?;
        }
        TaskAction::Add {
            name,
            cron,
            src,
            selection,
            description,
            created_by,
            disabled,
        } => {
            let Some(selection) = selection.selection()? else {
                anyhow::bail!("one of --hosts, --file or --group is required");
            };
            let task = tasks
                .create(NewTask {
                    name,
                    description,
                    source: src.source.to_string(),
                    cron_expr: cron,
                    selection,
                    params: src.params.to_params(),
                    enabled: !disabled,
                    created_by,
                })
                .await?;
            if json {
                print_json(&task)?;
            } else {
                println!("Task '{}' added (id {}).", task.name, task.id);
            }
        }
        TaskAction::Update {
            id,
            name,
            cron,
            source,
            description,
            selection,
            params,
        } => {
            let update = TaskUpdate {
                name,
                description,
                source: source.map(|s| s.to_string()),
                cron_expr: cron,
                selection: selection.selection()?,
                params: (!params.is_empty()).then(|| params.to_params()),
            };
            let task = tasks.update(id, update).await?;
            if json {
                print_json(&task)?;
            } else {
                println!("Task '{}' updated.", task.name);
            }
        }
        TaskAction::Enable { id } => {
            let task = tasks.set_enabled(id, true).await?;
            println!("Task '{}' enabled.", task.name);
        }
        TaskAction::Disable { id } => {
            let task = tasks.set_enabled(id, false).await?;
            println!("Task '{}' disabled.", task.name);
        }
        TaskAction::Delete { id } => {
            tasks.delete(id).await?;
            println!("Task {} deleted.", id);
        }
        TaskAction::DryRun { hours } => {
            tasks.restore_schedules().await?;
            let preview = tasks.scheduler().preview(hours).await;
            if json {
                print_json(&preview)?;
            } else if preview.is_empty() {
                println!("No runs scheduled in next {} hours.", hours);
            } else {
                println!("Upcoming runs (next {} hours):", hours);
                for run in preview {
                    println!("{} : {} (id {})", run.at.to_rfc3339(), run.task_name, run.task_id);
                }
            }
        }
    }

    tasks.scheduler().shutdown().await;
    Ok(())
}

fn run_executions(config: &AppConfig, action: ExecutionAction, json: bool) -> Result<()> {
    let pool = hostsync::open_database(config)?;
    let auditor = hostsync::audit::Auditor::new(pool);

    match action {
        ExecutionAction::List {
            task_id,
            source,
            limit,
        } => {
            let limit = limit
                .unwrap_or(config.sync.default_list_limit)
                .clamp(1, config.sync.max_list_limit.max(1));
            let list = auditor.list(&ExecutionFilter {
                task_id,
                source_kind: source,
                limit,
            })?;
            if json {
                return print_json(&list);
            }
            if list.is_empty() {
                println!("No executions found.");
                return Ok(());
            }
            println!(
                "{:<36} | {:<25} | {:<13} | {:<8} | {:>5} | {:>5} | {:>5} | {:>5}",
                "ID", "Started", "Source", "Status", "Total", "OK", "Fail", "Absent"
            );
            for e in list {
                println!(
                    "{:<36} | {:<25} | {:<13} | {:<8} | {:>5} | {:>5} | {:>5} | {:>5}",
                    e.id,
                    e.started_at,
                    e.source_kind.as_str(),
                    e.status.as_str(),
                    e.total,
                    e.succeeded,
                    e.failed,
                    e.not_in_source
                );
            }
        }
        ExecutionAction::Show { id } => {
            let Some(record) = auditor.get(&id)? else {
                anyhow::bail!("execution {} not found", id);
            };
            let details = auditor.details(&id)?;
            if json {
                return print_json(&serde_json::json!({ "execution": record, "details": details }));
            }
            println!("\n=== Execution {} ===", record.id);
            if let Some(name) = &record.task_name {
                println!("Task:     {}", name);
            }
            println!("Source:   {}", record.source_kind);
            println!("Status:   {}", record.status);
            println!("Started:  {}", record.started_at);
            if let Some(finished) = &record.finished_at {
                println!("Finished: {}", finished);
            }
            if let Some(err) = &record.error {
                println!("Error:    {}", err);
            }
            println!();
            for d in details {
                match (&d.error, d.cpu_max) {
                    (Some(err), _) => println!(" {:<16} {:<14} {}", d.address, d.outcome.as_str(), err),
                    (None, Some(cpu)) => println!(
                        " {:<16} {:<14} cpu {:.1}% mem {:.1}% disk {:.1}%",
                        d.address,
                        d.outcome.as_str(),
                        cpu,
                        d.mem_max.unwrap_or_default(),
                        d.disk_max.unwrap_or_default()
                    ),
                    (None, None) => println!(" {:<16} {}", d.address, d.outcome.as_str()),
                }
            }
            println!();
        }
    }
    Ok(())
}

fn run_hosts(config: &AppConfig, action: HostAction, json: bool) -> Result<()> {
    let pool = hostsync::open_database(config)?;
    let inventory = Inventory::new(pool);

    match action {
        HostAction::Show { address } => {
            let Some(host) = inventory.get_host(&address)? else {
                anyhow::bail!("host {} is not in the pool", address);
            };
            let metrics = inventory.current_metrics(&address)?;
            if json {
                return print_json(&serde_json::json!({ "host": host, "metrics": metrics }));
            }
            println!("Address:  {}", host.address);
            println!("Name:     {}", host.display_name);
            if let Some(remark) = &host.remark {
                println!("Remark:   {}", remark);
            }
            println!("Updated:  {}", host.updated_at);
            match metrics {
                Some(m) => {
                    println!("Captured: {}", m.captured_at);
                    println!("          {:>8} {:>8} {:>8}", "max", "avg", "min");
                    for (label, u) in [("cpu", m.cpu), ("memory", m.memory), ("disk", m.disk)] {
                        println!("{:<9} {:>8.2} {:>8.2} {:>8.2}", label, u.max, u.avg, u.min);
                    }
                }
                None => println!("No metrics recorded yet."),
            }
        }
    }
    Ok(())
}

async fn run_source(config: &AppConfig, action: SourceAction, json: bool) -> Result<()> {
    match action {
        SourceAction::Check { src, hosts } => {
            let factory = HttpSourceFactory::new(config.elasticsearch.clone(), config.cmsys.clone());
            let params = src.params.to_params();
            let source = factory.create(src.source, &params)?;
            let minutes = params
                .time_range_minutes
                .unwrap_or(config.sync.default_time_range_minutes);

            let hosts = dedup_hosts(&hosts);
            let found = source
                .query_many(&hosts, &TimeRange::last_minutes(minutes))
                .await?;
            let absent = absent_addresses(&hosts, &found);

            if json {
                return print_json(&serde_json::json!({ "found": found, "absent": absent }));
            }
            println!("{} of {} hosts have data in the last {} minutes", found.len(), hosts.len(), minutes);
            for m in &found {
                println!(
                    " + {:<16} cpu {:.1}% mem {:.1}% disk {:.1}% ({} points)",
                    m.address, m.cpu.max, m.memory.max, m.disk.max, m.points
                );
            }
            for a in &absent {
                println!(" - {:<16} no data", a);
            }
        }
    }
    Ok(())
}

fn run_location(config: &AppConfig, action: LocationAction, json: bool) -> Result<()> {
    let pool = hostsync::open_database(config)?;
    let inventory = Inventory::new(pool);

    match action {
        LocationAction::Add {
            name,
            pattern,
            priority,
        } => {
            let loc = inventory.add_location(&name, &pattern, priority)?;
            println!("Location '{}' -> {} (priority {}).", loc.name, loc.pattern, loc.priority);
        }
        LocationAction::List => {
            let list = inventory.list_locations()?;
            if json {
                return print_json(&list);
            }
            if list.is_empty() {
                println!("No locations defined.");
            }
            for l in list {
                println!("{:<5} {:<20} {:<20} {}", l.priority, l.name, l.pattern, l.id);
            }
        }
    }
    Ok(())
}
