//! Session teardown and the idle sweep.

use super::registry::SessionRegistry;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Removes a session and closes its upstream connection, if any.
///
/// Returns `false` when the session was already gone, so every teardown path can call
/// this without checking first.
pub fn teardown(registry: &mut SessionRegistry, session_id: &str, reason: &str) -> bool {
    let Some(mut session) = registry.remove(session_id) else {
        return false;
    };
    if let Some(upstream) = session.detach_upstream() {
        upstream.close();
    }
    info!(
        session_id,
        reason,
        buffered_audio_frames = session.recent_audio.len(),
        buffered_audio_bytes = session.recent_audio.total_bytes(),
        "Session closed."
    );
    true
}

/// Tears down every session idle for longer than `idle_timeout`. The client is not notified.
pub fn sweep_idle(registry: &mut SessionRegistry, now: Instant, idle_timeout: Duration) -> Vec<String> {
    let idle = registry.idle_sessions(now, idle_timeout);
    for session_id in &idle {
        info!(%session_id, "Cleaning up inactive connection.");
        teardown(registry, session_id, "idle timeout");
    }
    idle
}
