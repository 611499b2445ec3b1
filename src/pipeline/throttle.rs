//! Time-windowed throttle between producer and dispatch.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Forward at most one snapshot per `window`, plus the final snapshot.
///
/// A snapshot is forwarded when at least `window` has passed since the last
/// forward (or since the throttle started). Snapshots arriving sooner are held
/// and replaced by newer ones. When the input closes, a held snapshot is
/// flushed, so the output always ends with the input's last element. A zero
/// window forwards everything.
pub async fn throttle(
    mut input: mpsc::UnboundedReceiver<String>,
    output: mpsc::UnboundedSender<String>,
    window: Duration,
) {
    let mut last_emit = Instant::now();
    let mut held: Option<String> = None;

    while let Some(snapshot) = input.recv().await {
        let now = Instant::now();
        if now < last_emit + window {
            held = Some(snapshot);
            continue;
        }

        held = None;
        last_emit = now;
        if output.send(snapshot).is_err() {
            tracing::debug!("throttle output dropped");
            return;
        }
    }

    if let Some(snapshot) = held {
        let _ = output.send(snapshot);
    }
}
