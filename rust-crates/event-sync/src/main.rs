use anyhow::{
    Context,
    anyhow,
};
use clap::{
    ArgGroup,
    Parser,
};
use deployments::{
    DeploymentEnv,
    DeploymentStore,
};
use event_sync::{
    app::{
        App,
        DEFAULT_CHECKPOINT_BLOCKS,
        RunState,
        ecs::InMemoryEcs,
        gapfill::{
            GapFillOptions,
            GapFiller,
        },
        http_stream_service::SyncContext,
        init_tracing,
        json_rpc_log_source::{
            JsonRpcLogSource,
            WorldLogDecoder,
        },
        sled_storage::SledStateStorage,
        state_storage::StateStorage,
        stream::{
            EventStreamClient,
            StreamConfig,
        },
        visibility::{
            VisibilityConfig,
            VisibilityReconciler,
        },
    },
    transform::HexDecode,
};
use std::{
    env::current_dir,
    fs,
    path::PathBuf,
    sync::Arc,
};
use tokio::sync::mpsc;
use url::Url;

#[derive(Parser, Debug)]
#[command(
    version,
    about,
    long_about = None,
    group(
        ArgGroup::new("network")
            .args(["local", "dev", "test"])
            .required(true)
    )
)]
struct Args {
    /// Overrides the stream URL from the network record.
    #[arg(long)]
    stream_url: Option<Url>,

    /// Chain RPC used when the indexing service cannot fill a gap.
    #[arg(long)]
    rpc_url: Option<Url>,

    #[arg(long)]
    world_address: Option<String>,

    #[arg(long)]
    snapshot_dir: Option<PathBuf>,

    #[arg(long, default_value_t = DEFAULT_CHECKPOINT_BLOCKS)]
    checkpoint_blocks: u64,

    #[arg(long, default_value = "false")]
    include_system_calls: bool,

    #[arg(long, default_value = "false")]
    skip_rpc_fallback: bool,

    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[arg(short, long, default_value = "false")]
    tracing: bool,

    #[arg(long)]
    local: bool,

    #[arg(long)]
    dev: bool,

    #[arg(long)]
    test: bool,
}

async fn handle_interupt() {
    let res = tokio::signal::ctrl_c().await;
    match res {
        Ok(_) => {
            tracing::info!("Received interrupt, exiting");
        }
        Err(_) => {
            tracing::warn!("Received interrupt error, exiting anyway");
        }
    }
}

/// SIGUSR1 means "the operator is looking again": run a foreground catch-up.
#[cfg(unix)]
fn forward_foreground_signals(sender: mpsc::Sender<()>) -> anyhow::Result<()> {
    use tokio::signal::unix::{
        SignalKind,
        signal,
    };
    let mut signals = signal(SignalKind::user_defined1()).context("install SIGUSR1 handler")?;
    tokio::spawn(async move {
        while signals.recv().await.is_some() {
            if sender.try_send(()).is_err() {
                tracing::debug!("Foreground check already pending");
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn forward_foreground_signals(_sender: mpsc::Sender<()>) -> anyhow::Result<()> {
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = if args.tracing || args.log_dir.is_some() {
        init_tracing(args.log_dir.as_deref())
    } else {
        None
    };
    let (deployment_env, network_label) = if args.local {
        (DeploymentEnv::Local, "local")
    } else if args.dev {
        (DeploymentEnv::Dev, "dev")
    } else {
        (DeploymentEnv::Test, "test")
    };
    let store = DeploymentStore::new(deployment_env).context("opening deployments store")?;
    let record = store.load().context("loading network record")?;

    let stream_url = match (&args.stream_url, &record) {
        (Some(url), _) => url.to_string(),
        (None, Some(record)) => record.stream_url.clone(),
        (None, None) => {
            return Err(anyhow!(
                "No network record found for {network_label}; provide --stream-url"
            ));
        }
    };
    let world_address = args
        .world_address
        .clone()
        .or_else(|| record.as_ref().map(|r| r.world_address.clone()))
        .ok_or_else(|| {
            anyhow!("No network record found for {network_label}; provide --world-address")
        })?
        .to_ascii_lowercase();
    let rpc_url = args
        .rpc_url
        .as_ref()
        .map(Url::to_string)
        .or_else(|| record.as_ref().and_then(|r| r.rpc_url.clone()));
    let start_block = record.as_ref().and_then(|r| r.start_block);
    if let Some(ref record) = record {
        tracing::info!(
            "Using network record for {} (chain {}) recorded at {}",
            record.world_address,
            record.chain_id,
            record.recorded_at
        );
    }

    let execution_dir = current_dir().context("determine process working directory")?;
    let data_root = execution_dir
        .join("syncd_data")
        .join(network_label)
        .join(&world_address);
    let storage_path = match &args.snapshot_dir {
        Some(path) => path.clone(),
        None => data_root.join("snapshots"),
    };
    fs::create_dir_all(&storage_path)?;
    tracing::info!(
        "Using sled storage directory for {}: {}",
        world_address,
        storage_path.display()
    );

    let storage = SledStateStorage::open(&storage_path)?;
    let cache = storage.from_store().context("loading checkpoint")?;
    let mut ecs = InMemoryEcs::default();
    let replayed = cache.replay_into(&mut ecs);
    tracing::info!(
        "Replayed {} cached values up to block {}",
        replayed,
        cache.block_number
    );

    let context = SyncContext::new();
    let service = context.stream_service(&stream_url)?;
    let decode = Arc::new(HexDecode);
    let logs = rpc_url
        .map(|url| {
            JsonRpcLogSource::new(url, world_address.clone(), WorldLogDecoder, Arc::clone(&decode))
                .map(Arc::new)
        })
        .transpose()?;
    let gaps = GapFiller::new(
        Arc::clone(&service),
        logs,
        Arc::clone(&decode),
        GapFillOptions {
            skip_rpc_fallback: args.skip_rpc_fallback,
            ..GapFillOptions::default()
        },
    );
    let client = EventStreamClient::new(
        Arc::clone(&service),
        gaps,
        Arc::clone(&decode),
        StreamConfig {
            include_system_calls: args.include_system_calls,
            ..StreamConfig::default()
        },
    );
    let resume_block = if cache.block_number > 0 {
        Some(cache.block_number)
    } else {
        start_block
    };
    if let Some(block) = resume_block {
        tracing::info!("Resuming stream from block {}", block);
        client.handle().resume_from(block);
    }
    let (stream, events, stream_task) = client.spawn();

    let reconciler = VisibilityReconciler::new(
        service,
        decode,
        stream.clone(),
        VisibilityConfig::default(),
    )
    .with_last_known_block(cache.block_number);
    let (foreground_tx, foreground_rx) = mpsc::channel(1);
    forward_foreground_signals(foreground_tx)?;

    let mut app = App::new(
        events,
        foreground_rx,
        stream.clone(),
        reconciler,
        ecs,
        cache,
        storage,
        args.checkpoint_blocks,
    );

    tracing::info!("Starting sync service");
    loop {
        let interrupt = handle_interupt();
        match app.run(interrupt).await? {
            RunState::Continue => continue,
            RunState::Exit => {
                stream.shutdown();
                stream_task.await.context("joining stream task")?;
                tracing::info!("Exiting sync service");
                return Ok(());
            }
        }
    }
}
