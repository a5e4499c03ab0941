//! HTTP middleware stack.

pub mod cors;
pub mod trace;

pub use trace::CorrelationId;
