use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use nestling_core::models::{SyncPhase, SyncState};
use nestling_core::orchestrator::{
    DrainOutcome, DrainReport, SkipReason, SyncConfig, SyncOrchestrator, SyncTrigger,
    TriggerResult,
};
use nestling_core::queue::MutationQueue;
use nestling_core::sync_state::SyncStateHandle;

use crate::config::Config;
use crate::transport::HttpTransport;

pub(crate) struct SyncOptions {
    pub server: String,
    pub token: Option<String>,
    pub baby: Option<String>,
    pub watch: bool,
    pub interval: Duration,
    pub probe_interval: Duration,
}

fn describe_outcome(outcome: &DrainOutcome) -> String {
    match outcome {
        DrainOutcome::Completed => "queue drained".to_string(),
        DrainOutcome::Offline => "connection lost".to_string(),
        DrainOutcome::Transient { message } => format!("stopped: {message}"),
        DrainOutcome::RateLimited { reset_at } => match reset_at {
            Some(at) => format!("rate limited until {}", at.format("%H:%M:%S UTC")),
            None => "rate limited".to_string(),
        },
        DrainOutcome::Unauthenticated { message } => format!("not authenticated: {message}"),
        DrainOutcome::Forbidden { message } => format!("not allowed: {message}"),
        DrainOutcome::LeaseLost => "another sync took over".to_string(),
        DrainOutcome::Storage { message } => format!("queue storage error: {message}"),
    }
}

fn describe_skip(reason: &SkipReason) -> String {
    match reason {
        SkipReason::Offline => "server unreachable".to_string(),
        SkipReason::AlreadySyncing => "a sync is already running".to_string(),
        SkipReason::BackingOff { until } => {
            format!("rate limited until {}", until.format("%H:%M:%S UTC"))
        }
        SkipReason::LeaseHeld => "another process is syncing this queue".to_string(),
    }
}

fn print_report(report: &DrainReport) {
    println!(
        "Synced {} mutation(s), dropped {}, {} pending ({})",
        report.confirmed.len(),
        report.dropped.len(),
        report.remaining,
        describe_outcome(&report.outcome)
    );
    for dropped in &report.dropped {
        println!(
            "  dropped {} {} {}: {} ({})",
            dropped.mutation.payload.op,
            dropped.mutation.payload.entity,
            dropped.mutation.id,
            dropped.message,
            dropped.reason
        );
    }
    if let Some(status) = &report.rate_limit {
        println!(
            "  {} of {} calls left this window",
            status.remaining, status.limit
        );
    }
}

fn print_state(state: &SyncState) {
    let phase = match state.phase() {
        SyncPhase::Idle => "idle",
        SyncPhase::Draining => "syncing",
        SyncPhase::Offline => "offline",
    };
    eprintln!("[{phase}] {} pending", state.pending_count);
}

pub(crate) async fn cmd_sync(
    config: &Config,
    queue: Arc<MutationQueue>,
    options: SyncOptions,
    json: bool,
) -> Result<()> {
    let token = match options.token {
        Some(token) => token,
        None => config.saved_token()?.context(
            "No token. Pass --token, set NESTLING_TOKEN, or run `nestling admin add-caller --save`",
        )?,
    };
    let transport = HttpTransport::new(&options.server, token, options.baby)?;
    let online = transport.probe().await;

    let orchestrator = Arc::new(SyncOrchestrator::new(
        queue,
        transport,
        SyncStateHandle::default(),
        SyncConfig::default(),
    ));

    if !options.watch {
        orchestrator.set_online(online);
        let result = orchestrator.trigger(SyncTrigger::Manual).await;
        if json {
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else {
            match &result {
                TriggerResult::Drained(report) => print_report(report),
                TriggerResult::Ignored(reason) => {
                    let pending = orchestrator.state().snapshot().pending_count;
                    println!("Sync skipped: {} ({pending} pending)", describe_skip(reason));
                }
            }
        }
        return Ok(());
    }

    watch(orchestrator, online, options.interval, options.probe_interval, json).await
}

/// Drain on connectivity changes and on a timer until Ctrl-C.
async fn watch(
    orchestrator: Arc<SyncOrchestrator<HttpTransport>>,
    initially_online: bool,
    interval: Duration,
    probe_interval: Duration,
    json: bool,
) -> Result<()> {
    let (tx, rx) = mpsc::channel(8);
    let mut states = orchestrator.state().subscribe();

    let runner = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.run(rx, interval).await })
    };

    if initially_online {
        let _ = tx.send(SyncTrigger::Online).await;
    }
    eprintln!("Watching for changes (Ctrl-C to stop)");

    let mut probe = tokio::time::interval(probe_interval);
    probe.tick().await;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result.context("Failed to listen for Ctrl-C")?;
                break;
            }
            _ = probe.tick() => {
                let reachable = orchestrator.transport().probe().await;
                let was_online = orchestrator.state().snapshot().is_online;
                if reachable && !was_online {
                    tracing::info!("server reachable, syncing");
                    let _ = tx.send(SyncTrigger::Online).await;
                } else if !reachable && was_online {
                    tracing::warn!("server unreachable");
                    orchestrator.set_online(false);
                }
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                if json {
                    println!("{}", serde_json::to_string(&state)?);
                } else {
                    print_state(&state);
                }
            }
        }
    }

    // Closing the channel ends the run loop once any in-flight pass finishes.
    drop(tx);
    runner.await.context("sync loop panicked")?;

    let pending = orchestrator.state().snapshot().pending_count;
    eprintln!("Stopped; {pending} pending");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{AppState, build_router};
    use nestling_core::db::Database;
    use nestling_core::models::{CaregiverRole, EntityType, MutationPayload};
    use nestling_core::rate_limit::RateLimitConfig;
    use serde_json::{Value, json};

    const TOKEN: &str = "sync-token-0123456789abcdef";

    async fn spawn_server() -> (String, AppState) {
        let db = Database::open_in_memory().unwrap();
        let owner = db.create_caller("Sam", TOKEN).unwrap();
        db.create_baby(&owner.id, "Ada", None, None).unwrap();
        serve(db).await
    }

    async fn serve(db: Database) -> (String, AppState) {
        let state = AppState::new(db, RateLimitConfig::new(10, 15).unwrap());
        let app = build_router(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), state)
    }

    fn diaper(kind: &str) -> MutationPayload {
        let Value::Object(fields) = json!({ "kind": kind, "changed_at": "2025-03-01T08:00:00Z" })
        else {
            unreachable!()
        };
        MutationPayload::create(EntityType::Diaper, None, fields)
    }

    fn options(server: String, token: Option<&str>) -> SyncOptions {
        SyncOptions {
            server,
            token: token.map(str::to_string),
            baby: None,
            watch: false,
            interval: Duration::from_secs(30),
            probe_interval: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn test_one_shot_sync_drains_and_drops_invalid() {
        let (url, _state) = spawn_server().await;
        let dir = tempfile::tempdir().unwrap();
        let config = Config::in_dir(dir.path().to_path_buf()).unwrap();

        let queue = Arc::new(MutationQueue::in_memory());
        queue.enqueue(diaper("wet")).unwrap();
        queue.enqueue(diaper("glitter")).unwrap();
        queue.enqueue(diaper("dirty")).unwrap();

        cmd_sync(&config, Arc::clone(&queue), options(url, Some(TOKEN)), true)
            .await
            .unwrap();

        assert_eq!(queue.count().unwrap(), 0);
        let dropped = queue.dropped().unwrap();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].mutation.payload.fields["kind"], "glitter");
    }

    #[tokio::test]
    async fn test_sync_uses_saved_token() {
        let (url, _state) = spawn_server().await;
        let dir = tempfile::tempdir().unwrap();
        let config = Config::in_dir(dir.path().to_path_buf()).unwrap();

        let queue = Arc::new(MutationQueue::in_memory());
        queue.enqueue(diaper("wet")).unwrap();

        assert!(
            cmd_sync(&config, Arc::clone(&queue), options(url.clone(), None), true)
                .await
                .is_err()
        );

        config.save_token(TOKEN).unwrap();
        cmd_sync(&config, Arc::clone(&queue), options(url, None), true)
            .await
            .unwrap();
        assert_eq!(queue.count().unwrap(), 0);
    }

    fn queue_of_diapers() -> Arc<MutationQueue> {
        let queue = Arc::new(MutationQueue::in_memory());
        for kind in ["wet", "dirty", "mixed"] {
            queue.enqueue(diaper(kind)).unwrap();
        }
        queue
    }

    #[tokio::test]
    async fn test_unchosen_baby_keeps_queue() {
        let db = Database::open_in_memory().unwrap();
        let owner = db.create_caller("Sam", TOKEN).unwrap();
        db.create_baby(&owner.id, "Ada", None, None).unwrap();
        let second = db.create_baby(&owner.id, "Bo", None, None).unwrap();
        let (url, _state) = serve(db).await;
        let dir = tempfile::tempdir().unwrap();
        let config = Config::in_dir(dir.path().to_path_buf()).unwrap();

        let queue = queue_of_diapers();
        cmd_sync(&config, Arc::clone(&queue), options(url.clone(), Some(TOKEN)), true)
            .await
            .unwrap();
        assert_eq!(queue.count().unwrap(), 3);
        assert!(queue.dropped().unwrap().is_empty());

        // Naming the baby lets the same items through.
        let mut chosen = options(url, Some(TOKEN));
        chosen.baby = Some(second.id);
        cmd_sync(&config, Arc::clone(&queue), chosen, true).await.unwrap();
        assert_eq!(queue.count().unwrap(), 0);
        assert!(queue.dropped().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_viewer_keeps_queue() {
        let db = Database::open_in_memory().unwrap();
        let owner = db.create_caller("Sam", TOKEN).unwrap();
        let baby = db.create_baby(&owner.id, "Ada", None, None).unwrap();
        let viewer = db.create_caller("Nan", "viewer-token-0123456789abcdef").unwrap();
        db.link_caregiver(&viewer.id, &baby.id, CaregiverRole::Viewer).unwrap();
        let (url, _state) = serve(db).await;
        let dir = tempfile::tempdir().unwrap();
        let config = Config::in_dir(dir.path().to_path_buf()).unwrap();

        let queue = queue_of_diapers();
        cmd_sync(
            &config,
            Arc::clone(&queue),
            options(url, Some("viewer-token-0123456789abcdef")),
            true,
        )
        .await
        .unwrap();
        assert_eq!(queue.count().unwrap(), 3);
        assert!(queue.dropped().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_server_keeps_queue() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dir = tempfile::tempdir().unwrap();
        let config = Config::in_dir(dir.path().to_path_buf()).unwrap();
        let queue = Arc::new(MutationQueue::in_memory());
        queue.enqueue(diaper("wet")).unwrap();

        cmd_sync(&config, Arc::clone(&queue), options(format!("http://{addr}"), Some(TOKEN)), true)
            .await
            .unwrap();
        assert_eq!(queue.count().unwrap(), 1);
    }
}
