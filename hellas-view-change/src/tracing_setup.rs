use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use crate::Identity;

/// Installs a global `fmt` subscriber, filtered by `RUST_LOG` (default `info`).
pub fn init(json: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    }
}

/// Register a new replica with tracing
pub fn register_replica(id: &Identity, n: usize, f: usize) {
    info!(target: "register_replica", replica = ?id, total_replicas = n, max_faulty = f);
}

/// Track protocol transitions such as entering or finishing a view change
pub fn protocol_transition(
    replica: &Identity,
    transition_type: &str,
    from: impl std::fmt::Debug,
    to: impl std::fmt::Debug,
    reason: Option<&str>,
) {
    if let Some(reason) = reason {
        info!(
            target: "protocol_transition",
            replica = ?replica,
            transition = transition_type,
            from = ?from,
            to = ?to,
            reason = reason,
        );
    } else {
        info!(
            target: "protocol_transition",
            replica = ?replica,
            transition = transition_type,
            from = ?from,
            to = ?to,
        );
    }
}

/// Track message sending
pub fn message_sent(
    from: &Identity,
    to: Option<&Identity>,
    message_type: &str,
    message: impl std::fmt::Debug,
) {
    if let Some(to) = to {
        debug!(
            target: "message_sent",
            from = ?from,
            to = ?to,
            message_type = message_type,
            message = ?message,
        );
    } else {
        debug!(
            target: "message_sent",
            from = ?from,
            to = "broadcast",
            message_type = message_type,
            message = ?message,
        );
    }
}

/// Track NewView certificates built by a primary
pub fn new_view_built(primary: &Identity, new_view: impl std::fmt::Debug) {
    info!(
        target: "new_view_built",
        primary = ?primary,
        new_view = ?new_view,
    );
}

/// Track a replica adopting a finalized view
pub fn view_change_completed(
    replica: &Identity,
    view: impl std::fmt::Debug,
    stable_checkpoint: u64,
    batches: usize,
) {
    info!(
        target: "view_change_completed",
        replica = ?replica,
        view = ?view,
        stable_checkpoint = stable_checkpoint,
        batches = batches,
    );
}

/// Track rejected messages and other error conditions
pub fn protocol_error(replica: &Identity, error_type: &str, details: impl std::fmt::Debug) {
    error!(
        target: "protocol_error",
        replica = ?replica,
        error_type = error_type,
        details = ?details,
    );
}
