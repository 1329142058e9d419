//! Treasury transfers between the spot and futures wallets

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditSink};
use crate::core::config::TreasuryConfig;
use crate::core::{Error, Market, Result};
use crate::exchange::ExchangeAdapter;

use super::idempotency::{Acquired, IdempotencyGuard, transfer_key};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub from: Market,
    pub to: Market,
    pub amount_usdt: Decimal,
    #[serde(default)]
    pub reason: String,
    /// Caller-supplied key; derived from the request when absent
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransferOutcome {
    Ok,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub transfer_id: String,
    pub idempotency_key: String,
    pub result: TransferOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venue_transfer_id: Option<String>,
    /// epoch ms
    pub timestamp: i64,
}

pub struct Treasury {
    exchange: Arc<dyn ExchangeAdapter>,
    limits: TreasuryConfig,
    guard: Arc<IdempotencyGuard<TransferReceipt>>,
    audit: Arc<dyn AuditSink>,
}

impl Treasury {
    pub fn new(
        exchange: Arc<dyn ExchangeAdapter>,
        limits: TreasuryConfig,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            exchange,
            limits,
            guard: Arc::new(IdempotencyGuard::new()),
            audit,
        }
    }

    fn validate(&self, req: &TransferRequest) -> Result<()> {
        if req.amount_usdt <= Decimal::ZERO {
            return Err(Error::Structural(format!(
                "amount_usdt must be greater than 0, got {}",
                req.amount_usdt
            )));
        }
        if req.from == req.to {
            return Err(Error::BusinessRule(format!(
                "transfer source and destination are both {}",
                req.from
            )));
        }
        let min = Decimal::from_f64(self.limits.min_transfer_usdt).unwrap_or(Decimal::ZERO);
        let max = Decimal::from_f64(self.limits.max_transfer_usdt).unwrap_or(Decimal::MAX);
        if req.amount_usdt < min || req.amount_usdt > max {
            return Err(Error::BusinessRule(format!(
                "transfer amount must be between {} and {} USDT, got {}",
                min, max, req.amount_usdt
            )));
        }
        Ok(())
    }

    /// Execute a transfer at most once per idempotency key.
    ///
    /// A repeated request returns the original receipt. A failed transfer is
    /// not remembered, so the caller may resubmit it.
    pub async fn transfer(&self, req: TransferRequest) -> Result<TransferReceipt> {
        self.validate(&req)?;
        self.guard
            .prune(Duration::from_secs(self.limits.receipt_ttl_secs));

        let key = match &req.idempotency_key {
            Some(k) if !k.is_empty() => k.clone(),
            _ => transfer_key(
                req.from,
                req.to,
                req.amount_usdt,
                &req.reason,
                Utc::now(),
                self.limits.bucket_secs,
            ),
        };

        let ticket = match self.guard.acquire(&key).await {
            Acquired::Done(receipt) => {
                info!("♻️  Duplicate transfer {}, returning {}", key, receipt.transfer_id);
                return Ok(receipt);
            }
            Acquired::Owner(ticket) => ticket,
        };

        let transfer_id = format!("transfer_{}", Uuid::new_v4().simple());
        match self.exchange.transfer(req.from, req.to, req.amount_usdt).await {
            Ok(venue_id) => {
                let receipt = TransferReceipt {
                    transfer_id,
                    idempotency_key: key,
                    result: TransferOutcome::Ok,
                    message: Some("Transfer completed successfully".to_string()),
                    venue_transfer_id: Some(venue_id),
                    timestamp: Utc::now().timestamp_millis(),
                };
                info!(
                    "💸 Transfer {} {} → {} {} USDT ({})",
                    receipt.transfer_id, req.from, req.to, req.amount_usdt, req.reason
                );
                self.audit.record(AuditEvent::Transfer {
                    receipt: receipt.clone(),
                });
                ticket.complete(receipt.clone());
                Ok(receipt)
            }
            Err(e) => {
                warn!("Transfer {} failed: {}", transfer_id, e);
                self.audit.record(AuditEvent::Transfer {
                    receipt: TransferReceipt {
                        transfer_id,
                        idempotency_key: key,
                        result: TransferOutcome::Fail,
                        message: Some(e.to_string()),
                        venue_transfer_id: None,
                        timestamp: Utc::now().timestamp_millis(),
                    },
                });
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::NullSink;
    use crate::core::ErrorKind;
    use crate::exchange::PaperExchange;
    use rust_decimal_macros::dec;

    fn treasury() -> (Treasury, Arc<PaperExchange>) {
        let ex = Arc::new(PaperExchange::default());
        let t = Treasury::new(ex.clone(), TreasuryConfig::default(), Arc::new(NullSink));
        (t, ex)
    }

    fn req(amount: Decimal) -> TransferRequest {
        TransferRequest {
            from: Market::Spot,
            to: Market::Fut,
            amount_usdt: amount,
            reason: "margin top-up".into(),
            idempotency_key: None,
        }
    }

    #[tokio::test]
    async fn test_duplicate_returns_original_receipt() {
        let (t, ex) = treasury();
        let first = t.transfer(req(dec!(250))).await.unwrap();
        let second = t.transfer(req(dec!(250))).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(ex.transfers().len(), 1);
    }

    #[tokio::test]
    async fn test_limits_and_direction() {
        let (t, _) = treasury();
        let err = t.transfer(req(dec!(0.5))).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BusinessRuleViolation);
        assert!(t.transfer(req(dec!(10000.01))).await.is_err());

        let mut same = req(dec!(10));
        same.to = Market::Spot;
        assert!(t.transfer(same).await.is_err());

        let err = t.transfer(req(dec!(-1))).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StructuralValidation);
    }

    #[tokio::test]
    async fn test_failed_transfer_can_be_retried() {
        let (t, ex) = treasury();
        ex.set_fail_transfers(true);
        assert!(t.transfer(req(dec!(100))).await.is_err());
        ex.set_fail_transfers(false);
        let receipt = t.transfer(req(dec!(100))).await.unwrap();
        assert_eq!(receipt.result, TransferOutcome::Ok);
        assert_eq!(ex.transfers().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_receipt_is_forgotten() {
        let ex = Arc::new(PaperExchange::default());
        let limits = TreasuryConfig {
            receipt_ttl_secs: 0,
            ..TreasuryConfig::default()
        };
        let t = Treasury::new(ex.clone(), limits, Arc::new(NullSink));
        let mut keyed = req(dec!(100));
        keyed.idempotency_key = Some("sweep-1".into());

        let first = t.transfer(keyed.clone()).await.unwrap();
        let second = t.transfer(keyed).await.unwrap();
        assert_ne!(first.transfer_id, second.transfer_id);
        assert_eq!(ex.transfers().len(), 2);
    }
}
