// =============================================================================
// Central Application State
// =============================================================================
//
// Ties the long-lived components together for the HTTP surface and the
// account-event consumer. Components manage their own interior mutability;
// the few collections owned here sit behind `parking_lot::RwLock`.
// =============================================================================

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::api::hub::Broadcaster;
use crate::binance::FuturesClient;
use crate::cache::{KeyValueStore, MarketDataCache};
use crate::dispatch::ExecutionBackend;
use crate::feed::MarketFeed;
use crate::runtime_config::RuntimeConfig;
use crate::stream::events::{AccountUpdate, UserDataEvent};
use crate::stream::pool::StreamPool;
use crate::stream::session::PrivateSessionStream;
use crate::trigger::TriggerEngine;
use crate::types::BalanceInfo;

const MAX_RECENT_ERRORS: usize = 50;

#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    /// RFC 3339.
    pub at: String,
}

pub struct AppState {
    pub config: RuntimeConfig,
    pub admin_token: String,

    pub cache: Arc<MarketDataCache>,
    pub store: Arc<dyn KeyValueStore>,
    pub pool: Arc<StreamPool>,
    pub session: Option<Arc<PrivateSessionStream>>,
    pub feed: Arc<MarketFeed>,
    pub engine: Arc<TriggerEngine>,
    pub hub: Arc<Broadcaster>,
    pub exchange: Arc<FuturesClient>,
    pub backend: Arc<dyn ExecutionBackend>,

    /// Futures wallet balances keyed by asset.
    pub balances: RwLock<BTreeMap<String, BalanceInfo>>,
    pub recent_errors: RwLock<VecDeque<ErrorRecord>>,
    pub start_time: Instant,
}

impl AppState {
    pub fn push_error(&self, message: String) {
        let mut errors = self.recent_errors.write();
        errors.push_back(ErrorRecord {
            message,
            at: Utc::now().to_rfc3339(),
        });
        while errors.len() > MAX_RECENT_ERRORS {
            errors.pop_front();
        }
    }

    pub fn recent_errors(&self) -> Vec<ErrorRecord> {
        self.recent_errors.read().iter().cloned().collect()
    }

    pub fn set_balances(&self, balances: Vec<BalanceInfo>) {
        let mut map = self.balances.write();
        map.clear();
        for b in balances {
            map.insert(b.asset.clone(), b);
        }
    }

    pub fn balances(&self) -> Vec<BalanceInfo> {
        self.balances.read().values().cloned().collect()
    }

    /// Apply one private-stream event.
    pub fn apply_user_event(&self, event: UserDataEvent) {
        match event {
            UserDataEvent::Account(update) => self.apply_account_update(&update),
            UserDataEvent::Order(order) => {
                debug!(order = ?order, "order update");
            }
            UserDataEvent::MarginCall(call) => {
                warn!(margin_call = ?call, "margin call received");
                self.push_error(format!("margin call: {call:?}"));
            }
            UserDataEvent::ListenKeyExpired { event_time } => {
                warn!(event_time, "listen key expired");
            }
        }
    }

    fn apply_account_update(&self, update: &AccountUpdate) {
        let mut balances = self.balances.write();
        for b in &update.data.balances {
            let entry = balances.entry(b.asset.clone()).or_insert_with(|| BalanceInfo {
                asset: b.asset.clone(),
                wallet_balance: 0.0,
                cross_wallet_balance: 0.0,
                available_balance: 0.0,
            });
            entry.wallet_balance = b.wallet_balance;
            entry.cross_wallet_balance = b.cross_wallet_balance;
        }
        info!(
            reason = %update.data.reason,
            assets = update.data.balances.len(),
            "account balances updated"
        );
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("admin_token", &"[REDACTED]")
            .field("session", &self.session.is_some())
            .field("balances", &self.balances.read().len())
            .finish()
    }
}
