use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::sandbox::SandboxRunner;

/// Periodically removes sandboxes that outlived the job they belonged to
///
/// The first sweep runs immediately, so containers left by a crashed
/// previous process are removed at startup.
pub async fn reaper(runner: Arc<dyn SandboxRunner>, period: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    log::info!("Reaper started for {} backend, every {period:?}", runner.name());

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                log::info!("Reaper received shutdown signal, stopping");
                break;
            }

            _ = ticker.tick() => {
                match runner.reap_orphans().await {
                    Ok(0) => log::debug!("Reaper found no orphaned sandboxes"),
                    Ok(n) => log::warn!("Reaper removed {n} orphaned sandboxes"),
                    Err(e) => log::error!("Reaper sweep failed: {e}"),
                }
            }
        }
    }
}
