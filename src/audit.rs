//! Audit trail - fire-and-forget records of decisions and order lifecycle
//!
//! Recording never blocks and never fails the caller. Persistence lives on the
//! other side of the sink.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::{Decision, ErrorBody, Market, OrderIntent, OrderResult, Symbol};
use crate::execution::guard_stop::GuardStop;
use crate::execution::oco::Bracket;
use crate::execution::treasury::TransferReceipt;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    Decision {
        signal_id: String,
        symbol: Symbol,
        market: Market,
        decision: Decision,
        fired_rules: Vec<String>,
        score: f64,
        config_rev: u64,
    },
    IntentBuilt {
        intent: OrderIntent,
    },
    IntentRejected {
        intent_id: String,
        error: ErrorBody,
    },
    OrderResult {
        intent_id: String,
        result: OrderResult,
    },
    GuardStop {
        guard_stop: GuardStop,
    },
    Bracket {
        bracket: Bracket,
    },
    Transfer {
        receipt: TransferReceipt,
    },
}

impl AuditEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AuditEvent::Decision { .. } => "decision",
            AuditEvent::IntentBuilt { .. } => "intent_built",
            AuditEvent::IntentRejected { .. } => "intent_rejected",
            AuditEvent::OrderResult { .. } => "order_result",
            AuditEvent::GuardStop { .. } => "guard_stop",
            AuditEvent::Bracket { .. } => "bracket",
            AuditEvent::Transfer { .. } => "transfer",
        }
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Bounded channel to a persistence worker. Full ⇒ the event is dropped.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: flume::Sender<AuditEvent>,
}

impl ChannelSink {
    pub fn bounded(capacity: usize) -> (Self, flume::Receiver<AuditEvent>) {
        let (tx, rx) = flume::bounded(capacity);
        (Self { tx }, rx)
    }
}

impl AuditSink for ChannelSink {
    fn record(&self, event: AuditEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(flume::TrySendError::Full(event)) => {
                warn!("Audit channel full, dropping {} event", event.name());
            }
            Err(flume::TrySendError::Disconnected(event)) => {
                debug!("Audit receiver gone, dropping {} event", event.name());
            }
        }
    }
}

/// Writes each event as one JSON log line
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl AuditSink for LogSink {
    fn record(&self, event: AuditEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => info!(target: "chimera::audit", "{}", json),
            Err(e) => warn!("Failed to serialize {} audit event: {}", event.name(), e),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl AuditSink for NullSink {
    fn record(&self, _event: AuditEvent) {}
}
