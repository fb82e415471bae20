//! Wire-level protocol for the bacon namespace
//!
//! Topic construction and matching live in [`topics`]; payload shapes and the
//! field resolution rules for presence and signal traffic live in [`messages`].

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
