//! Inference module - the per-record model call.

mod command;
mod unit;

pub use command::*;
pub use unit::*;
