//! Order intents: construction from decisions and pre-routing validation

pub mod builder;
pub mod validator;

pub use builder::{MarketContext, OrderIntentBuilder};
pub use validator::{IntentValidator, validate_symbol};
