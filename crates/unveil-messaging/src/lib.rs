//! Pure messaging rules: who receives a message, what the SMS says, and
//! who may read what. Nothing in this crate touches storage or the network.

pub mod access;
pub mod error;
pub mod resolver;
pub mod sms;
pub mod tag;

pub use error::{AccessDenied, CompositionError, ResolutionError};
pub use sms::{ComplianceConfig, ComposeReason, ComposedSms, ContactHistory, compose};
