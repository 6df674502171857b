use std::process;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use conveyor_core::autoscale::{evaluate, ScalingConfig, WorkerPoolState};
use conveyor_core::trigger::{
    ImageMetadataProcessor, LocalObjectStore, ObjectCreatedNotification, ObjectStore,
    ObjectTriggerPipeline,
};
use conveyor_core::{
    Broker, ConveyorConfig, DeadLetterSource, DeadLetterStore, QueueStats, ResultStore,
    RocksDbStorage, Storage,
};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "conveyor", about = "Conveyor pipeline operator CLI")]
struct Cli {
    /// Data directory of a stopped conveyor-server
    #[arg(long, env = "CONVEYOR_DATA_DIR", default_value = "data", global = true)]
    data_dir: String,

    /// Configuration file (defaults apply when omitted)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect durable queues
    #[command(subcommand)]
    Queue(QueueCommands),

    /// Inspect and replay dead-letter records
    #[command(subcommand)]
    Dlq(DlqCommands),

    /// Read committed processing results
    #[command(subcommand)]
    Result(ResultCommands),

    /// Run the image pipeline over every object in a local bucket
    Trigger {
        /// Bucket name (a directory under the object root)
        #[arg(long)]
        bucket: String,

        /// Only objects whose key starts with this prefix
        #[arg(long, default_value = "")]
        prefix: String,

        /// Object store root (overrides server.object_root)
        #[arg(long)]
        object_root: Option<String>,
    },

    /// Scaling helpers
    #[command(subcommand)]
    Scale(ScaleCommands),
}

#[derive(Subcommand)]
enum QueueCommands {
    /// List all queues
    List,

    /// Show detailed queue statistics
    Inspect {
        /// Queue name
        name: String,
    },
}

#[derive(Subcommand)]
enum DlqCommands {
    /// List dead-letter records
    List,

    /// Show one record as JSON
    Show {
        /// Record id
        id: Uuid,
    },

    /// Re-enqueue a queue-sourced record to its original queue
    Replay {
        /// Record id
        id: Uuid,
    },
}

#[derive(Subcommand)]
enum ResultCommands {
    /// Show the result committed for an object key
    Get {
        /// Object key
        key: String,
    },
}

#[derive(Subcommand)]
enum ScaleCommands {
    /// Print the decision the autoscaler would make, ignoring cooldowns
    Plan {
        /// Current desired count
        #[arg(long)]
        current: u32,

        /// Observed utilization in percent
        #[arg(long)]
        utilization: f64,

        /// Override autoscaling.min_tasks
        #[arg(long)]
        min: Option<u32>,

        /// Override autoscaling.max_tasks
        #[arg(long)]
        max: Option<u32>,

        /// Override autoscaling.target_utilization_percent
        #[arg(long)]
        target: Option<f64>,
    },
}

fn fail(msg: impl std::fmt::Display) -> ! {
    eprintln!("Error: {msg}");
    process::exit(1);
}

fn load_config(path: Option<&str>) -> ConveyorConfig {
    match path {
        Some(path) => ConveyorConfig::load(path).unwrap_or_else(|e| fail(e)),
        None => ConveyorConfig::default(),
    }
}

fn open_storage(data_dir: &str) -> Arc<dyn Storage> {
    match RocksDbStorage::open(data_dir) {
        Ok(storage) => Arc::new(storage),
        Err(e) => fail(format!("cannot open data directory \"{data_dir}\": {e}")),
    }
}

/// Starts a scheduler, which reclaims expired leases on the way up.
fn open_broker(config: &ConveyorConfig, storage: Arc<dyn Storage>) -> Broker {
    Broker::new(&config.scheduler, storage).unwrap_or_else(|e| fail(e))
}

fn cmd_queue_list(storage: &dyn Storage) {
    let queues = QueueStats::read_all_from_storage(storage).unwrap_or_else(|e| fail(e));
    if queues.is_empty() {
        println!("No queues found.");
        return;
    }

    let name_width = queues
        .iter()
        .map(|q| q.queue_id.len())
        .max()
        .unwrap_or(4)
        .max(4);

    println!(
        "{:<name_width$}  {:>7}  {:>9}  {:>7}",
        "NAME", "DEPTH", "IN_FLIGHT", "WAITING"
    );
    for q in &queues {
        println!(
            "{:<name_width$}  {:>7}  {:>9}  {:>7}",
            q.queue_id, q.depth, q.in_flight, q.waiting_receivers
        );
    }
}

fn cmd_queue_inspect(storage: &dyn Storage, name: String) {
    let config = match storage.get_queue(&name) {
        Ok(Some(config)) => config,
        Ok(None) => fail(format!("queue \"{name}\" not found")),
        Err(e) => fail(e),
    };
    let stats = QueueStats::read_from_storage(storage, &config).unwrap_or_else(|e| fail(e));
    println!("Queue: {name}");
    println!("  Depth:               {}", stats.depth);
    println!("  In-flight:           {}", stats.in_flight);
    println!("  Waiting receivers:   {}", stats.waiting_receivers);
    println!("  Visibility timeout:  {} ms", stats.visibility_timeout_ms);
    println!("  Retention:           {} ms", stats.retention_ms);
}

fn cmd_dlq_list(store: &DeadLetterStore) {
    let records = store.list().unwrap_or_else(|e| fail(e));
    if records.is_empty() {
        println!("No dead-letter records.");
        return;
    }

    let source_width = records
        .iter()
        .map(|r| r.source.to_string().len())
        .max()
        .unwrap_or(6)
        .max(6);

    println!(
        "{:<36}  {:<source_width$}  {:<20}  {:>10}  {:>13}",
        "ID", "SOURCE", "REASON", "DELIVERIES", "MOVED_AT_MS"
    );
    for r in &records {
        println!(
            "{:<36}  {:<source_width$}  {:<20}  {:>10}  {:>13}",
            r.id,
            r.source.to_string(),
            r.reason.to_string(),
            r.original_message.delivery_count,
            r.moved_at / 1_000_000
        );
    }
}

fn cmd_dlq_show(store: &DeadLetterStore, id: Uuid) {
    match store.get(&id) {
        Ok(Some(record)) => match serde_json::to_string_pretty(&record) {
            Ok(json) => println!("{json}"),
            Err(e) => fail(e),
        },
        Ok(None) => fail(format!("dead-letter record {id} does not exist")),
        Err(e) => fail(e),
    }
}

async fn cmd_dlq_replay(store: &DeadLetterStore, broker: &Broker, id: Uuid) {
    match store.get(&id) {
        Ok(Some(record)) => {
            if !matches!(record.source, DeadLetterSource::Queue { .. }) {
                fail(format!(
                    "record {id} came from {}; replay it through a running conveyor-server",
                    record.source
                ));
            }
        }
        Ok(None) => fail(format!("dead-letter record {id} does not exist")),
        Err(e) => fail(e),
    }

    match store.replay_to_queue(broker, id).await {
        Ok(message_id) => println!("Replayed record {id} as message {message_id}"),
        Err(e) => fail(e),
    }
}

fn cmd_result_get(store: &ResultStore, key: String) {
    match store.get(&key) {
        Ok(Some(result)) => match serde_json::to_string_pretty(&result) {
            Ok(json) => println!("{json}"),
            Err(e) => fail(e),
        },
        Ok(None) => fail(format!("no result for key \"{key}\"")),
        Err(e) => fail(e),
    }
}

async fn cmd_trigger(
    config: &ConveyorConfig,
    storage: Arc<dyn Storage>,
    bucket: String,
    prefix: String,
    object_root: Option<String>,
) {
    let root = object_root.unwrap_or_else(|| config.server.object_root.clone());
    let objects = LocalObjectStore::new(root);
    let keys = objects
        .list_objects(&bucket, &prefix)
        .await
        .unwrap_or_else(|e| fail(e));
    if keys.is_empty() {
        println!("No objects in \"{bucket}\" matching prefix \"{prefix}\".");
        return;
    }

    let pipeline = ObjectTriggerPipeline::new(
        config.object_trigger.clone(),
        Arc::new(objects),
        Arc::new(ImageMetadataProcessor::new(config.image.clone())),
        ResultStore::new(Arc::clone(&storage)),
        DeadLetterStore::new(storage),
    );

    let key_width = keys.iter().map(|k| k.len()).max().unwrap_or(3).max(3);
    println!("{:<key_width$}  OUTCOME", "KEY");
    let mut failed = 0;
    for key in &keys {
        let notification = ObjectCreatedNotification::new(bucket.clone(), key.clone());
        match pipeline.handle(&notification).await {
            Ok(outcome) => println!("{key:<key_width$}  {}", outcome.label()),
            Err(e) => {
                failed += 1;
                println!("{key:<key_width$}  error: {e}");
            }
        }
    }
    println!(
        "Handled {} object{}, {failed} failed",
        keys.len(),
        if keys.len() == 1 { "" } else { "s" }
    );
}

fn cmd_scale_plan(
    config: &ConveyorConfig,
    current: u32,
    utilization: f64,
    min: Option<u32>,
    max: Option<u32>,
    target: Option<f64>,
) {
    let scaling = ScalingConfig {
        min_tasks: min.unwrap_or(config.autoscaling.min_tasks),
        max_tasks: max.unwrap_or(config.autoscaling.max_tasks),
        target_utilization_percent: target.unwrap_or(config.autoscaling.target_utilization_percent),
        ..config.autoscaling.clone()
    };
    if let Err(e) = scaling.validate() {
        fail(e);
    }

    let state = WorkerPoolState::with_desired(&scaling, current);
    match evaluate(&state, &scaling, utilization / 100.0, Instant::now()) {
        Ok(decision) => {
            println!("Current:  {}", state.desired_count);
            println!("Decision: {}", decision.label());
            println!("{decision:?}");
        }
        Err(e) => fail(e),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref());

    match cli.command {
        Commands::Scale(ScaleCommands::Plan {
            current,
            utilization,
            min,
            max,
            target,
        }) => cmd_scale_plan(&config, current, utilization, min, max, target),
        Commands::Queue(cmd) => {
            let storage = open_storage(&cli.data_dir);
            match cmd {
                QueueCommands::List => cmd_queue_list(storage.as_ref()),
                QueueCommands::Inspect { name } => cmd_queue_inspect(storage.as_ref(), name),
            }
        }
        Commands::Dlq(cmd) => {
            let storage = open_storage(&cli.data_dir);
            let store = DeadLetterStore::new(Arc::clone(&storage));
            match cmd {
                DlqCommands::List => cmd_dlq_list(&store),
                DlqCommands::Show { id } => cmd_dlq_show(&store, id),
                DlqCommands::Replay { id } => {
                    let broker = open_broker(&config, storage);
                    cmd_dlq_replay(&store, &broker, id).await;
                }
            }
        }
        Commands::Result(ResultCommands::Get { key }) => {
            let store = ResultStore::new(open_storage(&cli.data_dir));
            cmd_result_get(&store, key);
        }
        Commands::Trigger {
            bucket,
            prefix,
            object_root,
        } => {
            let storage = open_storage(&cli.data_dir);
            cmd_trigger(&config, storage, bucket, prefix, object_root).await;
        }
    }
}
