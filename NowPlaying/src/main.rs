mod logs;
mod simulated;

use anyhow::Result;
use npconfig::get_config;
use npcontrol::{
    NowPlayingConfigExt, NowPlayingService, PollingAdapter, PushAdapter, ServiceKind,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::simulated::{SimulatedFetcher, SimulatedLiveConnection, SimulatedSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let config = get_config();
    logs::init_logging(&config);

    // ========== Configuration ==========
    let settings = config.get_controller_settings()?;
    info!(
        config_dir = config.get_config_dir().unwrap_or("<embedded>"),
        priority = %settings.priority(),
        "Configuration loaded"
    );
    info!(
        "Resolved settings: {}",
        serde_json::to_string(&settings).unwrap_or_default()
    );

    // ========== Sources ==========
    let mut service = NowPlayingService::new(settings.clone());
    for kind in ServiceKind::ALL {
        let policy = settings.policy(kind);
        service = match policy.poll_interval() {
            Some(interval) => service.with_adapter(PollingAdapter::new(
                kind,
                SimulatedFetcher::new(kind, interval),
                interval,
            )),
            None => service.with_adapter(PushAdapter::new(kind, SimulatedSubscriber::new(kind))),
        };
        info!(service = %kind, "Simulated source registered");
    }
    let handle = service.with_live_connection(SimulatedLiveConnection).spawn();

    // ========== Output ==========
    let mut snapshots = handle.snapshots();
    let mut status = handle.status();

    info!("✅ NowPlaying is running, press Ctrl+C to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received");
                break;
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                match serde_json::to_string(&snapshot) {
                    Ok(line) => println!("{{\"snapshot\":{line}}}"),
                    Err(err) => warn!("Cannot serialize snapshot: {err}"),
                }
            }
            event = status.recv() => match event {
                Ok(event) => {
                    if let Some(err) = event.as_fatal_error() {
                        warn!("{err}");
                    }
                    println!("{{\"status\":{}}}", event.to_json());
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Status feed lagging"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    handle.shutdown().await;
    info!("NowPlaying stopped");
    Ok(())
}
