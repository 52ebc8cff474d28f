//! Cascade controller
//!
//! Reacts to change events from the executor and sweeps every rule on a timer
//! so that external desired-state writes and dropped events are picked up.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::controllers::Context;
use crate::reconcilers::ChangeEvent;

/// Run the cascade loop until `shutdown` fires or every event sender is gone
pub async fn run(
    context: Arc<Context>,
    mut events: mpsc::Receiver<ChangeEvent>,
    shutdown: CancellationToken,
) {
    info!("Starting cascade controller");

    let mut interval = tokio::time::interval(context.config.cascade_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => sweep(&context).await,
            event = events.recv() => match event {
                Some(event) => handle(&context, &event).await,
                None => {
                    info!("Change event channel closed");
                    break;
                }
            },
        }
    }
    info!("Cascade controller stopped");
}

#[instrument(skip(context))]
async fn sweep(context: &Context) {
    if let Err(e) = context.cascades.sweep().await {
        error!(error = %e, "Cascade sweep failed");
    }
}

#[instrument(skip_all, fields(kind = %event.kind, id = %event.id, phase = %event.phase))]
async fn handle(context: &Context, event: &ChangeEvent) {
    if let Err(e) = context.cascades.handle(event).await {
        error!(error = %e, "Cascade propagation failed");
    }
}
