//! MUSKIE - Object Store HTTP Gateway
//!
//! Main entry point: load configuration, wire the components together,
//! start the background loops (placement refresh, throttle reaper, orphan
//! drain), and serve.

use muskie::config::Config;
use muskie::context::ProcessContext;
use muskie::meta::envelope::Envelope;
use muskie::meta::snaplink::SnaplinkGate;
use muskie::meta::{MemoryIndex, StaticRoleResolver};
use muskie::ops::OrphanSink;
use muskie::picker::{HttpNodeDirectory, NodeDirectory, Picker};
use muskie::shark::SharkRegistry;
use muskie::throttle::Throttle;
use std::panic;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    panic::set_hook(Box::new(|panic_info| {
        eprintln!("MUSKIE fatal error:");
        eprintln!("{}", panic_info);
        if let Some(location) = panic_info.location() {
            eprintln!(
                "Location: {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            );
        }
    }));

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(path)?,
        None => {
            let mut config = Config::default();
            config.apply_env();
            config
        }
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        version = muskie::VERSION,
        port = config.port,
        "starting object store gateway"
    );

    let directory: Arc<dyn NodeDirectory> = Arc::new(HttpNodeDirectory::new(
        config.placement.directory_url.clone(),
        config.placement.operator_utilization_pct,
        config.placement.staleness_window_s,
    ));

    let picker = Picker::new(config.placement.clone());
    picker.refresh(directory.as_ref()).await;
    picker.spawn_refresh(Arc::clone(&directory));

    let throttle = Throttle::new(config.throttle.clone());
    throttle.spawn_reaper();

    let (orphans, mut orphan_rx) = OrphanSink::new();
    // the reclamation pipeline is external; this end just keeps a durable
    // trace in the logs
    tokio::spawn(async move {
        while let Some(orphan) = orphan_rx.recv().await {
            tracing::warn!(
                object_id = %orphan.object_id,
                owner = %orphan.owner,
                sharks = ?orphan.sharks.iter().map(|s| s.storage_id.as_str()).collect::<Vec<_>>(),
                "orphaned backend data awaiting offline cleanup"
            );
        }
    });

    let process = Arc::new(ProcessContext {
        envelope: Envelope::new(Arc::new(MemoryIndex::new())),
        picker,
        sharks: SharkRegistry::new(config.shark.clone()),
        throttle,
        roles: Arc::new(StaticRoleResolver::new()),
        snaplinks: SnaplinkGate::new(
            config.snaplink_cleanup_required,
            &config.accounts_snaplinks_disabled,
        ),
        orphans,
        config,
    });

    muskie::server::serve(process).await
}
