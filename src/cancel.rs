//! Process-wide cancellation.
//!
//! A single `CancellationToken` is shared by every executor. Ctrl-C cancels it;
//! the in-flight agent call aborts (session backend) or is killed (process
//! backend) and the orchestrator unwinds with `IvanError::Cancelled` after
//! cleaning up its worktree.

use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Cancel `token` on the first Ctrl-C. A second Ctrl-C exits immediately.
pub fn install_ctrl_c_handler(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Interrupt received, cancelling the running task (press Ctrl-C again to force exit)");
        token.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });
}

/// Sleep for `duration`, returning `false` if the token was cancelled first.
pub async fn sleep_or_cancel(token: &CancellationToken, duration: std::time::Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sleep_completes_without_cancel() {
        let token = CancellationToken::new();
        assert!(sleep_or_cancel(&token, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_sleep_interrupted_by_cancel() {
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            child.cancel();
        });
        let started = std::time::Instant::now();
        assert!(!sleep_or_cancel(&token, Duration::from_secs(30)).await);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
