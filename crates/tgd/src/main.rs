use std::{sync::Arc, time::Duration};

use anyhow::Context as _;
use tokio_util::sync::CancellationToken;

use tgd_core::{
    config::{Config, Mode},
    context::Context,
    dispatcher::Dispatcher,
    domain::Update,
    filters,
    offset::{FileOffsetStore, OffsetTracker},
    queue::UpdateQueue,
    registry::{callback_fn, Flow, HandlerRegistry, HandlerSpec},
    scheduler::{job_fn, JobScheduler},
    source::Poller,
    webhook::WebhookReceiver,
};
use tgd_http::{webhook, BotApiClient, BotApiSource};

const OFFSET_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tgd_core::logging::init("tgd")?;

    let cfg = Arc::new(Config::load()?);
    let offsets = Arc::new(
        OffsetTracker::restore(Arc::new(FileOffsetStore::new(&cfg.offset_file)))
            .await
            .context("failed to restore offset cursor")?,
    );
    let queue = UpdateQueue::new(cfg.queue_capacity, cfg.queue_full_policy);
    let jobs = JobScheduler::new();

    let dispatcher = Dispatcher::builder(queue.clone(), Arc::new(handlers()))
        .config(&cfg)
        .error_handlers(Arc::new(error_handlers()))
        .jobs(jobs.clone())
        .build();
    dispatcher.start();

    let stats = dispatcher.clone();
    jobs.run_repeating(
        "stats",
        Duration::from_secs(60),
        Duration::from_secs(60),
        job_fn(move |_| {
            let snapshot = stats.stats();
            async move {
                tracing::info!(?snapshot, "dispatch stats");
                anyhow::Ok(())
            }
        }),
    );

    let cancel = CancellationToken::new();
    let client = BotApiClient::from_config(&cfg)?;
    let mut acquisition = match cfg.mode {
        Mode::Polling => {
            client.delete_webhook(false).await?;
            let source = Arc::new(BotApiSource::new(client, cfg.allowed_update_names()));
            let poller = Poller::from_config(&cfg, source, offsets.clone(), queue.clone());
            let token = cancel.clone();
            tokio::spawn(async move { poller.run(token).await })
        }
        Mode::Webhook => {
            let url = cfg
                .webhook_url
                .as_deref()
                .context("TGD_WEBHOOK_URL is required in webhook mode")?;
            client
                .set_webhook(
                    url,
                    cfg.webhook_secret.as_deref(),
                    &cfg.allowed_update_names(),
                    cfg.drop_pending_updates,
                )
                .await?;
            tokio::spawn(flush_offsets(offsets.clone(), cancel.clone()));

            let receiver =
                WebhookReceiver::new(queue.clone(), offsets.clone(), cfg.allowed_updates.clone());
            let app = webhook::router(&cfg.webhook_path, receiver, cfg.webhook_secret.clone());
            tokio::spawn(webhook::serve(cfg.webhook_listen, app, cancel.clone()))
        }
    };

    let outcome = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for ctrl-c")?;
            tracing::info!("interrupt received, shutting down");
            Ok(())
        }
        res = &mut acquisition => match res {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(anyhow::Error::new(e).context("update acquisition stopped")),
            Err(e) => Err(anyhow::anyhow!("update acquisition task failed: {e}")),
        },
    };

    cancel.cancel();
    // Wakes producers parked on a full queue; the webhook answers them with 503.
    queue.close();
    if !acquisition.is_finished()
        && tokio::time::timeout(cfg.shutdown_grace, &mut acquisition)
            .await
            .is_err()
    {
        tracing::warn!("update acquisition did not stop in time, aborting");
        acquisition.abort();
    }
    jobs.stop();
    let report = dispatcher.shutdown(cfg.shutdown_grace).await;
    if let Err(e) = offsets.flush().await {
        tracing::error!(error = %e, "final offset flush failed");
    }
    tracing::info!(
        abandoned = report.abandoned,
        unprocessed = report.unprocessed,
        cursor = offsets.next_cursor(),
        "stopped"
    );

    outcome
}

/// Webhook mode has no batch boundary, so the cursor is persisted on a timer.
async fn flush_offsets(offsets: Arc<OffsetTracker>, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(OFFSET_FLUSH_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                if let Err(e) = offsets.flush().await {
                    tracing::warn!(error = %e, "offset flush failed");
                }
            }
        }
    }
}

fn handlers() -> HandlerRegistry {
    let registry = HandlerRegistry::new();

    registry.add(HandlerSpec::new(
        "start",
        filters::command("start"),
        callback_fn(|update: Arc<Update>, ctx: Context| async move {
            let seen = ctx.with_chat_data(|data| {
                let n = data.get("starts").and_then(|v| v.as_u64()).unwrap_or(0) + 1;
                data.insert("starts".into(), n.into());
                n
            });
            tracing::info!(update_id = %update.id, chat = ?update.chat_id(), ?seen, "/start");
            anyhow::Ok(Flow::Stop)
        }),
    ));

    registry.add(
        HandlerSpec::new(
            "log",
            filters::any(),
            callback_fn(|update: Arc<Update>, _ctx: Context| async move {
                tracing::debug!(
                    update_id = %update.id,
                    kind = %update.kind,
                    text = update.text().unwrap_or(""),
                    "update"
                );
                anyhow::Ok(Flow::Continue)
            }),
        )
        .group(1)
        .non_blocking(),
    );

    registry
}

fn error_handlers() -> HandlerRegistry {
    let registry = HandlerRegistry::new();
    registry.add(HandlerSpec::new(
        "report",
        filters::any(),
        callback_fn(|update: Arc<Update>, ctx: Context| async move {
            if let Some(failure) = ctx.error() {
                tracing::error!(update_id = %update.id, error = %failure, "handler failed");
            }
            anyhow::Ok(Flow::Continue)
        }),
    ));
    registry
}
