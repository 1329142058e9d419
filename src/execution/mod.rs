//! Execution layer - routing, protection orders and transfers

pub mod engine;
pub mod guard_stop;
pub mod idempotency;
pub mod oco;
pub mod treasury;

pub use engine::{ExecutionEngine, spawn_guard_stop_monitor, split_notional};
pub use guard_stop::{GuardStop, GuardStopBook, GuardStopStatus};
pub use idempotency::{Acquired, IdempotencyGuard, IdempotencyTicket, transfer_key};
pub use oco::{Bracket, BracketBook, BracketStatus, Leg};
pub use treasury::{TransferOutcome, TransferReceipt, TransferRequest, Treasury};
