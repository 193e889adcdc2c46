//! Wire-level value types and topic semantics
//!
//! Everything in here is transport independent: message and envelope types in
//! [`messages`], wildcard matching and prefix rules in [`topics`].

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
