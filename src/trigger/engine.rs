// =============================================================================
// Trigger Engine — periodic evaluation of listening watch conditions
// =============================================================================
//
// Each tick:
//   1. load every `listening` condition from the store
//   2. for each enabled one, read its instrument's latest price (one read per
//      condition) and evaluate the predicate
//   3. guard rejections go `listening → failed` directly; everything else is
//      claimed `listening → dispatching` with a compare-and-set so a condition
//      is never dispatched twice, even by overlapping ticks or a second
//      process sharing the store
//   4. claimed conditions are dispatched concurrently and finish as
//      `triggered` or `failed`
//
// One bad condition never aborts the tick: every failure is recorded on the
// condition itself.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use futures_util::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::hub::Broadcaster;
use crate::cache::{KeyValueStore, MarketDataCache};
use crate::dispatch::OrderDispatcher;
use crate::notify::Notifier;
use crate::runtime_config::{millis, TriggerConfig};
use crate::trigger::predicate::{funding_guard, should_trigger};
use crate::types::{EstimateStatus, PriceSample, WatchCondition};

#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub evaluated: usize,
    pub skipped_no_price: usize,
    pub fired: usize,
    pub triggered: usize,
    pub failed: usize,
    /// Conditions another tick or process claimed first.
    pub lost_claims: usize,
}

impl TickReport {
    pub fn changed(&self) -> bool {
        self.triggered + self.failed > 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub ticks: u64,
    pub triggered: u64,
    pub failed: u64,
    pub tick_errors: u64,
}

pub struct TriggerEngine {
    store: Arc<dyn KeyValueStore>,
    prices: Arc<MarketDataCache>,
    dispatcher: Arc<OrderDispatcher>,
    hub: Arc<Broadcaster>,
    notifier: Notifier,
    cfg: TriggerConfig,
    ticks: AtomicU64,
    triggered: AtomicU64,
    failed: AtomicU64,
    tick_errors: AtomicU64,
}

impl TriggerEngine {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        prices: Arc<MarketDataCache>,
        dispatcher: Arc<OrderDispatcher>,
        hub: Arc<Broadcaster>,
        notifier: Notifier,
        cfg: TriggerConfig,
    ) -> Self {
        Self {
            store,
            prices,
            dispatcher,
            hub,
            notifier,
            cfg,
            ticks: AtomicU64::new(0),
            triggered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            tick_errors: AtomicU64::new(0),
        }
    }

    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(millis(engine.cfg.tick_ms.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(
                tick_ms = engine.cfg.tick_ms,
                short_funding_threshold = engine.cfg.short_funding_threshold,
                "trigger engine started"
            );
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match engine.tick().await {
                            Ok(report) if report.fired > 0 => debug!(report = ?report, "tick complete"),
                            Ok(_) => {}
                            Err(e) => {
                                engine.tick_errors.fetch_add(1, Ordering::Relaxed);
                                warn!(error = %format!("{e:#}"), "trigger tick failed");
                            }
                        }
                    }
                }
            }
            info!("trigger engine stopped");
        })
    }

    /// Fail conditions left in `dispatching` by a previous run. Their
    /// dispatch outcome is unknown, so they are not retried.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let stuck: Vec<WatchCondition> = self
            .store
            .list_estimates()
            .await?
            .into_iter()
            .filter(|c| c.status == EstimateStatus::Dispatching)
            .collect();

        let mut recovered = 0;
        for c in stuck {
            let claimed = self
                .store
                .compare_and_set_status(
                    &c.id,
                    EstimateStatus::Dispatching,
                    EstimateStatus::Failed,
                    Some("dispatch interrupted by restart; outcome unknown"),
                )
                .await?;
            if let Some(c) = claimed {
                warn!(id = %c.id, symbol = %c.symbol, "interrupted dispatch marked failed");
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    pub async fn tick(&self) -> Result<TickReport> {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        let mut report = TickReport::default();
        let conditions = self.store.list_active_estimates().await?;
        let mut claimed: Vec<(WatchCondition, f64)> = Vec::new();

        for condition in conditions.into_iter().filter(|c| c.is_active()) {
            report.evaluated += 1;
            let Some(sample) = self.current_price(&condition.symbol).await else {
                report.skipped_no_price += 1;
                continue;
            };
            if !should_trigger(&condition, sample.mark_price) {
                continue;
            }
            report.fired += 1;
            info!(
                id = %condition.id,
                symbol = %condition.symbol,
                side = %condition.side,
                action = %condition.action_type,
                current = sample.mark_price,
                target = condition.target_price,
                "watch condition met"
            );

            if let Some(reason) =
                funding_guard(&condition, sample.funding_rate, self.cfg.short_funding_threshold)
            {
                match self.reject(&condition, &reason).await {
                    Ok(true) => report.failed += 1,
                    Ok(false) => report.lost_claims += 1,
                    Err(e) => warn!(id = %condition.id, error = %format!("{e:#}"), "failed to record guard rejection"),
                }
                continue;
            }

            match self
                .store
                .compare_and_set_status(&condition.id, EstimateStatus::Listening, EstimateStatus::Dispatching, None)
                .await
            {
                Ok(Some(c)) => claimed.push((c, sample.mark_price)),
                Ok(None) => {
                    debug!(id = %condition.id, "condition already claimed");
                    report.lost_claims += 1;
                }
                Err(e) => warn!(id = %condition.id, error = %format!("{e:#}"), "claim failed"),
            }
        }

        let outcomes = join_all(claimed.into_iter().map(|(c, price)| self.finish(c, price))).await;
        for ok in outcomes {
            if ok {
                report.triggered += 1;
            } else {
                report.failed += 1;
            }
        }

        if report.changed() {
            if let Err(e) = self.hub.push_estimates().await {
                warn!(error = %format!("{e:#}"), "estimate broadcast failed");
            }
        }
        Ok(report)
    }

    async fn current_price(&self, symbol: &str) -> Option<PriceSample> {
        let sample = match self.prices.get(symbol) {
            Some(s) => Some(s),
            None => match self.store.get_price(symbol).await {
                Ok(s) => s,
                Err(e) => {
                    debug!(symbol, error = %e, "external price lookup failed");
                    None
                }
            },
        };
        sample.filter(|s| s.mark_price > 0.0)
    }

    /// Move a guard-rejected condition straight to `failed`. Returns false if
    /// it was no longer listening.
    async fn reject(&self, condition: &WatchCondition, reason: &str) -> Result<bool> {
        let Some(c) = self
            .store
            .compare_and_set_status(&condition.id, EstimateStatus::Listening, EstimateStatus::Failed, Some(reason))
            .await?
        else {
            return Ok(false);
        };
        self.failed.fetch_add(1, Ordering::Relaxed);

        warn!(id = %c.id, symbol = %c.symbol, reason, "dispatch blocked by guard");
        self.notifier.send(format!(
            "🚫 {} {} {} blocked\n{}",
            c.symbol, c.side, c.action_type, reason
        ));
        Ok(true)
    }

    /// Dispatch a claimed condition and persist the outcome. Returns whether
    /// it ended `triggered`.
    async fn finish(&self, mut condition: WatchCondition, price: f64) -> bool {
        let outcome = self.dispatcher.dispatch(&condition, price).await;
        condition.updated_at = Utc::now();
        let ok = match outcome {
            Ok(intent) => {
                condition.status = EstimateStatus::Triggered;
                condition.triggered_price = Some(price);
                condition.error_message = None;
                self.triggered.fetch_add(1, Ordering::Relaxed);
                info!(id = %condition.id, symbol = %condition.symbol, intent = intent.label(), price, "condition triggered");
                self.notifier.send(format!(
                    "✅ {} {} {} executed at {}",
                    condition.symbol, condition.side, condition.action_type, price
                ));
                true
            }
            Err(e) => {
                let reason = format!("{e:#}");
                condition.status = EstimateStatus::Failed;
                condition.error_message = Some(reason.clone());
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(id = %condition.id, symbol = %condition.symbol, error = %reason, "dispatch failed");
                self.notifier.send(format!(
                    "❌ {} {} {} failed\n{}",
                    condition.symbol, condition.side, condition.action_type, reason
                ));
                false
            }
        };

        if let Err(e) = self.store.set_estimate(&condition).await {
            error!(
                id = %condition.id,
                status = %condition.status,
                error = %format!("{e:#}"),
                "failed to persist dispatch outcome; condition stays dispatching"
            );
        }
        ok
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            triggered: self.triggered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            tick_errors: self.tick_errors.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
