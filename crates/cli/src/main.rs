//! Conveyor CLI - inspect and operate broker queues

mod settings;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use conveyor_core::application::{HolderStrategy, JoinOptions, TopologyKind};
use conveyor_core::domain::{ActorDescriptor, QueueName};
use conveyor_core::Broker;
use conveyor_infra_amqp::AmqpTransport;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tabled::{Table, Tabled};
use tracing::{debug, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use settings::Settings;

const DEFAULT_LOG_FILTER: &str = "conveyor=info";

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(about = "Conveyor queue operations", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (TOML)
    #[arg(long, env = "CONVEYOR_CONFIG")]
    config: Option<String>,

    /// Broker URL, overrides the settings file
    #[arg(long, env = "CONVEYOR_URL")]
    url: Option<String>,

    /// Connection holder strategy
    #[arg(long, value_enum)]
    strategy: Option<StrategyArg>,

    /// Queue topology variant
    #[arg(long, value_enum)]
    topology: Option<TopologyArg>,
}

#[derive(Clone, Copy, ValueEnum)]
enum StrategyArg {
    Pooled,
    Shared,
}

#[derive(Clone, Copy, ValueEnum)]
enum TopologyArg {
    Default,
    DlxRouting,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the canonical, delay and dead-letter names of a queue
    Names { queue: String },

    /// Declare the queue and its delay and dead-letter queues
    Declare { queue: String },

    /// Message counts of the queue triple
    Counts { queue: String },

    /// Purge the queue triple
    Flush { queue: String },

    /// Delete the queue triple
    Delete {
        queue: String,

        /// Refuse while consumers are attached
        #[arg(long)]
        if_unused: bool,

        /// Refuse while messages are queued
        #[arg(long)]
        if_empty: bool,
    },

    /// Enqueue one message
    Publish {
        queue: String,

        /// Actor the message is addressed to
        #[arg(short, long)]
        actor: String,

        /// Positional arguments as a JSON array
        #[arg(long, default_value = "[]")]
        args: String,

        /// Keyword arguments as a JSON object
        #[arg(long, default_value = "{}")]
        kwargs: String,

        /// Delay before delivery (ms)
        #[arg(long)]
        delay: Option<u64>,

        /// Native broker priority
        #[arg(short, long)]
        priority: Option<u8>,
    },

    /// Wait until the queue and its delay queue are empty
    Join {
        queue: String,

        /// Give up after this many ms
        #[arg(long)]
        timeout: Option<u64>,
    },
}

#[derive(Tabled)]
struct NameRow {
    role: &'static str,
    queue: String,
}

#[derive(Tabled)]
struct CountRow {
    queue: String,
    messages: u32,
}

fn init_tracing() -> Result<()> {
    let log_format =
        std::env::var("CONVEYOR_LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_LOG_FILTER))
        .context("Failed to create env filter")?;

    match log_format.as_str() {
        "json" => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        _ => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty().with_writer(std::io::stderr))
            .init(),
    }
    Ok(())
}

impl Cli {
    fn apply(&self, settings: &mut Settings) {
        if let Some(url) = &self.url {
            settings.amqp.url = url.clone();
        }
        if let Some(strategy) = self.strategy {
            settings.holder.strategy = match strategy {
                StrategyArg::Pooled => HolderStrategy::Pooled,
                StrategyArg::Shared => HolderStrategy::Shared,
            };
        }
        if let Some(topology) = self.topology {
            settings.topology_kind = match topology {
                TopologyArg::Default => TopologyKind::Default,
                TopologyArg::DlxRouting => TopologyKind::DlxRouting,
            };
        }
    }
}

fn build_broker(settings: &Settings) -> Result<Broker> {
    let transport = Arc::new(AmqpTransport::new(settings.amqp.clone()));
    debug!(url = %settings.amqp.redacted_url(), strategy = ?settings.holder.strategy, "Building broker");

    Broker::builder()
        .transport(transport, settings.holder.clone())
        .topology(settings.topology_kind.build(settings.topology.clone()))
        .options(settings.broker.clone())
        .build()
        .context("Invalid broker settings")
}

fn name_table(names: &QueueName) -> String {
    Table::new(vec![
        NameRow {
            role: "canonical",
            queue: names.canonical.clone(),
        },
        NameRow {
            role: "delay",
            queue: names.delayed.clone(),
        },
        NameRow {
            role: "dead-letter",
            queue: names.dead_letter.clone(),
        },
    ])
    .to_string()
}

async fn run(broker: &Broker, command: Commands) -> Result<()> {
    match command {
        Commands::Names { queue } => {
            println!("{}", name_table(&broker.topology().names(&queue)));
        }

        Commands::Declare { queue } => {
            broker.declare_queue(&queue, true).await?;
            println!("{}", format!("✓ Queue {} declared", queue).green().bold());
            println!();
            println!("{}", name_table(&broker.topology().names(&queue)));
        }

        Commands::Counts { queue } => {
            let names = broker.topology().names(&queue);
            let counts = broker.get_queue_message_counts(&queue).await?;
            let rows = vec![
                CountRow {
                    queue: names.canonical,
                    messages: counts.canonical,
                },
                CountRow {
                    queue: names.delayed,
                    messages: counts.delayed,
                },
                CountRow {
                    queue: names.dead_letter,
                    messages: counts.dead_letter,
                },
            ];
            println!("{}", Table::new(rows));
        }

        Commands::Flush { queue } => {
            broker.declare_queue(&queue, true).await?;
            broker.flush(&queue).await?;
            println!("{}", format!("✓ Queue {} flushed", queue).green().bold());
        }

        Commands::Delete {
            queue,
            if_unused,
            if_empty,
        } => {
            broker.delete_queue(&queue, if_unused, if_empty).await?;
            println!("{}", format!("✓ Queue {} deleted", queue).green().bold());
        }

        Commands::Publish {
            queue,
            actor,
            args,
            kwargs,
            delay,
            priority,
        } => {
            let args: Vec<Value> =
                serde_json::from_str(&args).context("--args must be a JSON array")?;
            let kwargs: Map<String, Value> =
                serde_json::from_str(&kwargs).context("--kwargs must be a JSON object")?;

            broker
                .declare_actor(ActorDescriptor::new(actor.as_str(), queue.as_str()))
                .await?;
            let mut message = broker.new_message(&actor, args, kwargs)?;
            if let Some(priority) = priority {
                message = message.with_broker_priority(priority);
            }

            let message = broker.enqueue(message, delay).await?;
            println!(
                "{}",
                format!("✓ Message {} enqueued on {}", message.message_id, message.queue_name)
                    .green()
                    .bold()
            );
        }

        Commands::Join { queue, timeout } => {
            let options = match timeout {
                Some(ms) => JoinOptions::with_timeout(Duration::from_millis(ms)),
                None => JoinOptions::default(),
            };
            broker.join(&queue, options).await?;
            println!("{}", format!("✓ Queue {} is drained", queue).green().bold());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    let cli = Cli::parse();
    let mut settings = settings::load(cli.config.as_deref())?;
    cli.apply(&mut settings);

    let broker = build_broker(&settings)?;
    let outcome = run(&broker, cli.command).await;

    if let Err(err) = broker.close().await {
        warn!(error = %err, "Failed to close broker connections");
    }

    outcome
}
