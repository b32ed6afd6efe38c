mod commands;
mod config;
mod server;
mod transport;

use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::{ArgAction, Parser, Subcommand};

use crate::commands::{
    SyncOptions, cmd_admin_add_baby, cmd_admin_add_caller, cmd_admin_list, cmd_admin_share,
    cmd_admin_use, cmd_growth_curve, cmd_growth_percentile, cmd_queue_add, cmd_queue_count,
    cmd_queue_discard, cmd_queue_dropped, cmd_queue_list, cmd_sync,
};
use crate::config::Config;
use nestling_core::db::Database;
use nestling_core::queue::MutationQueue;
use nestling_core::rate_limit::{DEFAULT_LIMIT, DEFAULT_WINDOW_MINUTES, RateLimitConfig};

#[derive(Parser)]
#[command(
    name = "nestling",
    version,
    about = "A local-first baby tracker with offline sync",
    long_about = "Log feedings, sleep, diapers and growth offline. Entries wait in a local \
                  queue and are delivered to a nestling server when it is reachable."
)]
struct Cli {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue entries locally; they are sent on the next sync
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Deliver queued entries to the server
    Sync {
        /// Server base URL
        #[arg(long, env = "NESTLING_SERVER_URL", default_value = "http://127.0.0.1:8080")]
        server: String,
        /// Bearer token (defaults to the token saved by `admin add-caller --save`)
        #[arg(long, env = "NESTLING_TOKEN", hide_env_values = true)]
        token: Option<String>,
        /// Baby to log for, when the caller has several
        #[arg(long, env = "NESTLING_BABY_ID")]
        baby: Option<String>,
        /// Keep running: sync when the server becomes reachable and on a timer
        #[arg(short, long)]
        watch: bool,
        /// Seconds between timed syncs in watch mode
        #[arg(long, default_value = "30")]
        interval: u64,
        /// Seconds between connectivity probes in watch mode
        #[arg(long, default_value = "10")]
        probe_interval: u64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// WHO growth reference charts
    Growth {
        #[command(subcommand)]
        command: GrowthCommands,
    },
    /// Start the sync server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// Address to bind to (default: 127.0.0.1, use 0.0.0.0 to expose to network)
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: String,
        /// Mutations allowed per caller and baby in each window
        #[arg(long, env = "NESTLING_RATE_LIMIT", default_value_t = DEFAULT_LIMIT)]
        rate_limit: u32,
        /// Rate limit window length in minutes (windows start at UTC midnight)
        #[arg(long, env = "NESTLING_RATE_WINDOW_MINUTES", default_value_t = DEFAULT_WINDOW_MINUTES)]
        window_minutes: u32,
    },
    /// Manage callers and babies in the server store
    Admin {
        #[command(subcommand)]
        command: AdminCommands,
    },
}

#[derive(Subcommand)]
enum QueueCommands {
    /// Queue a mutation
    Add {
        /// Entity: feeding, sleep, diaper, growth, vaccination, appointment
        entity: String,
        /// Fields as key=value (e.g. kind=bottle amount="4 fl oz" started_at=now)
        fields: Vec<String>,
        /// Operation: create, update, delete
        #[arg(long, default_value = "create")]
        op: String,
        /// Entry id (required for update and delete)
        #[arg(long)]
        target: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List queued mutations, oldest first
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show how many mutations are pending
    Count {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove a queued mutation without sending it
    Discard {
        /// Queued mutation ID
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show mutations the server refused
    Dropped {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum GrowthCommands {
    /// Print the 3rd/15th/50th/85th/97th percentile curves by month
    Curve {
        /// Metric: weight, length, head
        metric: String,
        /// Sex: male, female
        sex: String,
        /// Months to chart (at least 12 are always shown)
        #[arg(short, long, default_value = "24")]
        months: u32,
        /// Units: metric, imperial
        #[arg(short, long, default_value = "metric")]
        units: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Place a measurement on the reference curves
    Percentile {
        /// Metric: weight, length, head
        metric: String,
        /// Sex: male, female
        sex: String,
        /// Measurement with unit (e.g. "3.4kg", "7 lb 4 oz", "52cm", "20.5in")
        value: String,
        /// Age in days at measurement
        #[arg(long, conflicts_with = "birth_date")]
        age_days: Option<f64>,
        /// Birth date (YYYY-MM-DD); age is counted to --on
        #[arg(long)]
        birth_date: Option<String>,
        /// Measurement date (YYYY-MM-DD, default: today)
        #[arg(long, requires = "birth_date")]
        on: Option<String>,
        /// Units for display: metric, imperial
        #[arg(short, long, default_value = "metric")]
        units: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum AdminCommands {
    /// Register a caller and print their token
    AddCaller {
        /// Display name
        name: String,
        /// Also save the token for this machine's `sync`
        #[arg(long)]
        save: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Add a baby owned by a caller
    AddBaby {
        /// Owner caller ID or name
        owner: String,
        /// Baby's name
        name: String,
        /// Birth date (YYYY-MM-DD)
        #[arg(long)]
        birth_date: Option<String>,
        /// Sex: male, female
        #[arg(long)]
        sex: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Give a caller access to a baby
    Share {
        /// Caller ID or name
        caller: String,
        /// Baby ID
        baby_id: String,
        /// Role: owner, caregiver, viewer
        #[arg(short, long, default_value = "caregiver")]
        role: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Set the baby a caller logs for by default
    Use {
        /// Caller ID or name
        caller: String,
        /// Baby ID
        baby_id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List callers and the babies they can access
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(verbose: u8, quiet: bool) -> Result<()> {
    let level = if quiet {
        "error"
    } else {
        match verbose {
            0 => "warn",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_env("NESTLING_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {e}"))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    init_tracing(cli.verbose, cli.quiet)?;
    let config = Config::load()?;

    match cli.command {
        Commands::Queue { command } => {
            let queue = MutationQueue::open(&config.queue_path)?;
            match command {
                QueueCommands::Add {
                    entity,
                    fields,
                    op,
                    target,
                    json,
                } => cmd_queue_add(&queue, &entity, &op, target, &fields, json),
                QueueCommands::List { json } => cmd_queue_list(&queue, json),
                QueueCommands::Count { json } => cmd_queue_count(&queue, json),
                QueueCommands::Discard { id, json } => cmd_queue_discard(&queue, &id, json),
                QueueCommands::Dropped { json } => cmd_queue_dropped(&queue, json),
            }
        }
        Commands::Sync {
            server,
            token,
            baby,
            watch,
            interval,
            probe_interval,
            json,
        } => {
            if interval == 0 || probe_interval == 0 {
                bail!("--interval and --probe-interval must be at least 1 second");
            }
            let queue = Arc::new(MutationQueue::open(&config.queue_path)?);
            let options = SyncOptions {
                server,
                token,
                baby,
                watch,
                interval: Duration::from_secs(interval),
                probe_interval: Duration::from_secs(probe_interval),
            };
            cmd_sync(&config, queue, options, json).await
        }
        Commands::Growth { command } => match command {
            GrowthCommands::Curve {
                metric,
                sex,
                months,
                units,
                json,
            } => cmd_growth_curve(&metric, &sex, months, &units, json),
            GrowthCommands::Percentile {
                metric,
                sex,
                value,
                age_days,
                birth_date,
                on,
                units,
                json,
            } => cmd_growth_percentile(
                &metric, &sex, &value, age_days, birth_date, on, &units, json,
            ),
        },
        Commands::Serve {
            port,
            bind,
            rate_limit,
            window_minutes,
        } => {
            let rate_limit = RateLimitConfig::new(rate_limit, window_minutes)?;
            let db = Database::open(&config.server_db_path)?;
            server::start_server(db, port, &bind, rate_limit).await
        }
        Commands::Admin { command } => {
            let db = Database::open(&config.server_db_path)?;
            match command {
                AdminCommands::AddCaller { name, save, json } => {
                    cmd_admin_add_caller(&db, &config, &name, save, json)
                }
                AdminCommands::AddBaby {
                    owner,
                    name,
                    birth_date,
                    sex,
                    json,
                } => cmd_admin_add_baby(&db, &owner, &name, birth_date, sex.as_deref(), json),
                AdminCommands::Share {
                    caller,
                    baby_id,
                    role,
                    json,
                } => cmd_admin_share(&db, &caller, &baby_id, &role, json),
                AdminCommands::Use {
                    caller,
                    baby_id,
                    json,
                } => cmd_admin_use(&db, &caller, &baby_id, json),
                AdminCommands::List { json } => cmd_admin_list(&db, json),
            }
        }
    }
}
