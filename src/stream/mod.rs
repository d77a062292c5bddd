// =============================================================================
// Streaming transport — connections, the public stream pool, and the private
// account stream
// =============================================================================

pub mod backoff;
pub mod connection;
pub mod events;
pub mod pool;
pub mod session;

/// Escalations raised once local recovery in the transport layer is
/// exhausted. Consumed by the notifier.
#[derive(Debug, Clone)]
pub enum StreamAlert {
    ConnectionExhausted { conn_id: u64, attempts: u32 },
    PoolUnavailable { error: String },
    SessionExhausted { attempts: u32, error: String },
    SessionUnhealthy { reason: String },
}

impl StreamAlert {
    pub fn describe(&self) -> String {
        match self {
            Self::ConnectionExhausted { conn_id, attempts } => format!(
                "Market stream connection #{conn_id} gave up after {attempts} reconnect attempts"
            ),
            Self::PoolUnavailable { error } => {
                format!("Market stream pool cannot open a connection: {error}")
            }
            Self::SessionExhausted { attempts, error } => format!(
                "Account stream stopped reconnecting after {attempts} attempts (last error: {error})"
            ),
            Self::SessionUnhealthy { reason } => format!("Account stream unhealthy: {reason}"),
        }
    }
}
