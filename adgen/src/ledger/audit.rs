//! Periodic consistency check of running balances against a full log replay.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{Ledger, Result};

/// Replay every account once, logging each inconsistency. Returns the number of bad accounts.
pub async fn audit_once<L: Ledger + ?Sized>(ledger: &L) -> Result<usize> {
    let audits = ledger.verify_all().await?;
    let mut inconsistent = 0;

    for audit in audits.iter().filter(|a| !a.is_consistent()) {
        inconsistent += 1;
        tracing::error!(
            user_id = %audit.user_id,
            running_balance = audit.running_balance,
            replayed_balance = audit.replayed_balance,
            mismatched_snapshots = ?audit.mismatched_snapshots,
            "Credit ledger inconsistency detected"
        );
    }

    tracing::debug!(accounts = audits.len(), inconsistent, "Ledger audit finished");
    Ok(inconsistent)
}

/// Run [`audit_once`] every `interval` until `shutdown` is cancelled.
pub async fn run_audit<L: Ledger + ?Sized>(ledger: Arc<L>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    // First audit one full interval after startup
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!("Ledger audit stopping");
                return;
            }
            _ = ticker.tick() => {
                if let Err(e) = audit_once(ledger.as_ref()).await {
                    tracing::error!(error = %e, "Ledger audit failed");
                }
            }
        }
    }
}
