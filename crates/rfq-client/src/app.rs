//! Main application orchestration.
//!
//! Coordinates:
//! - The connection manager task and its handle
//! - Sink events (quotes, prices, notices) into logs and metrics
//! - Snapshot changes into connection gauges
//! - Periodic quote requests

use crate::config::{AppConfig, QuoteTarget};
use crate::error::{AppError, AppResult};
use rfq_core::QuoteResponse;
use rfq_telemetry::Metrics;
use rfq_ws::{
    ConnectionHandle, ConnectionManager, ConnectionSnapshot, Connector, NoticeLevel, SinkEvent,
    TungsteniteConnector, WsError,
};
use std::future::Future;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

const SINK_BUFFER: usize = 1_000;

/// What the client saw while running.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub quotes_received: u64,
    pub price_updates: u64,
    pub notices: u64,
    pub last_quote: Option<QuoteResponse>,
}

/// Main application.
pub struct Application {
    config: AppConfig,
}

impl Application {
    pub fn new(config: AppConfig) -> AppResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Run against the real maker until Ctrl-C.
    pub async fn run(self) -> AppResult<RunSummary> {
        self.run_with(TungsteniteConnector, shutdown_signal()).await
    }

    /// Run with the given transport until `shutdown` resolves.
    pub async fn run_with<C: Connector>(
        self,
        connector: C,
        shutdown: impl Future<Output = ()>,
    ) -> AppResult<RunSummary> {
        let (sink_tx, mut sink_rx) = mpsc::channel(SINK_BUFFER);
        let (handle, manager_task) =
            ConnectionManager::spawn(self.config.connection_config(), connector, Some(sink_tx))?;
        let mut snapshots = handle.subscribe_snapshots();

        // Pairs registered before init are synced on the first open.
        for pair in self.config.subscription_pairs()? {
            handle.subscribe_pair(&pair).await?;
        }
        if !handle
            .init(&self.config.maker_url, &self.config.client_id)
            .await?
        {
            return Err(AppError::Config(
                "maker_url and client_id are required".to_string(),
            ));
        }

        info!(
            maker_url = %self.config.maker_url,
            client_id = %self.config.client_id,
            "Entering main event loop"
        );

        let mut summary = RunSummary::default();
        let mut gauges = SnapshotGauges::default();
        let mut quote_interval = tokio::time::interval(self.config.quote_interval());
        quote_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }

                Some(event) = sink_rx.recv() => handle_sink_event(event, &mut summary),

                changed = snapshots.changed() => {
                    if changed.is_err() {
                        warn!("Connection manager stopped unexpectedly");
                        break;
                    }
                    let snapshot = snapshots.borrow_and_update().clone();
                    gauges.record(&snapshot);
                }

                _ = quote_interval.tick() => {
                    request_quotes(&handle, &self.config.quotes.requests).await;
                }
            }
        }

        info!("Shutting down");
        if let Err(e) = handle.close().await {
            warn!(error = %e, "Close failed during shutdown");
        }
        handle.shutdown();
        if let Err(e) = manager_task.await {
            error!(error = %e, "Connection manager task failed");
        }

        // The manager dropped its sender; collect what is left.
        while let Some(event) = sink_rx.recv().await {
            handle_sink_event(event, &mut summary);
        }
        gauges.record(&handle.diagnostics());

        if self.config.telemetry.dump_metrics_on_exit {
            info!(metrics = %Metrics::gather_text()?, "Final metrics");
        }

        info!(
            quotes = summary.quotes_received,
            prices = summary.price_updates,
            notices = summary.notices,
            "Application stopped"
        );
        Ok(summary)
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

async fn request_quotes(handle: &ConnectionHandle, targets: &[QuoteTarget]) {
    if targets.is_empty() {
        return;
    }
    if !handle.is_connected() {
        debug!("Not connected, skipping quote round");
        return;
    }

    for target in targets {
        match handle
            .request_quote(&target.from_asset, &target.to_asset, target.amount)
            .await
        {
            Ok(()) => {}
            Err(WsError::NotConnected) => {
                debug!("Connection dropped during quote round");
                return;
            }
            Err(e) => warn!(
                from = %target.from_asset,
                to = %target.to_asset,
                error = %e,
                "Quote request not queued"
            ),
        }
    }
}

fn handle_sink_event(event: SinkEvent, summary: &mut RunSummary) {
    match event {
        SinkEvent::Connectivity(connected) => {
            info!(connected, "Connectivity changed");
        }
        SinkEvent::Quote(quote) => {
            let pair = quote.pair().to_string();
            info!(
                pair = %pair,
                from_amount = ?quote.from_amount,
                to_amount = quote.to_amount,
                rfq_id = ?quote.rfq_id,
                "Quote received"
            );
            Metrics::quote_received(&pair);
            summary.quotes_received += 1;
            summary.last_quote = Some(quote);
        }
        SinkEvent::Price(update) => {
            let pair = update.pair.as_deref().unwrap_or("unknown");
            debug!(pair, price = ?update.price, "Price update");
            Metrics::price_update(pair);
            summary.price_updates += 1;
        }
        SinkEvent::Subscribed(pair) => debug!(pair = %pair, "Subscribed"),
        SinkEvent::Unsubscribed(pair) => debug!(pair = %pair, "Unsubscribed"),
        SinkEvent::Notice(notice) => {
            match notice.level {
                NoticeLevel::Warning => warn!(
                    kind = %notice.kind,
                    persistent = notice.persistent,
                    "{}",
                    notice.message
                ),
                NoticeLevel::Error => error!(
                    kind = %notice.kind,
                    persistent = notice.persistent,
                    "{}",
                    notice.message
                ),
            }
            Metrics::notice_raised(&notice.kind.to_string());
            summary.notices += 1;
        }
        SinkEvent::DismissNotice(kind) => debug!(kind = %kind, "Notice dismissed"),
    }
}

/// Mirrors snapshots into the Prometheus gauges.
#[derive(Debug, Default)]
struct SnapshotGauges {
    reconnects_seen: u64,
}

impl SnapshotGauges {
    fn record(&mut self, snapshot: &ConnectionSnapshot) {
        Metrics::ws_connected(snapshot.is_connected);
        Metrics::ws_state_set(&snapshot.state.to_string());
        Metrics::queue_depth(snapshot.queued_messages);
        Metrics::circuit_state(snapshot.circuit_breaker_state.as_gauge());
        Metrics::stability_score(snapshot.stability.score);
        Metrics::heartbeat_missed(snapshot.heartbeat.missed);

        if snapshot.reconnects_scheduled > self.reconnects_seen {
            let reason = snapshot
                .last_disconnect_reason
                .map_or("unknown", |r| r.as_str());
            for _ in self.reconnects_seen..snapshot.reconnects_scheduled {
                Metrics::ws_reconnect(reason);
            }
            self.reconnects_seen = snapshot.reconnects_scheduled;
        }
    }
}
