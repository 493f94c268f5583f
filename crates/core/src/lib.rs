//! `kitqueue-core`: building blocks shared by the queue engine.
//!
//! This crate has **no infrastructure concerns**: identifiers, the domain error
//! model and the clock abstraction every "now" read goes through.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{JobId, RunId};
