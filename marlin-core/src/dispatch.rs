//! Command registration and dispatch.
//!
//! Every command declares dispatch metadata (`arity`, `first_key`, `last_key`,
//! `key_step`) so key extraction for lock planning works without running the command.
//! Handlers are plain functions over the session context and the shared dispatch
//! context; shared flows live in `set_generic` and `rmw`.

use std::sync::Arc;

use marlin_store::SegmentRouter;

use crate::command::{CommandReply, Session};
use marlin_common::error::MarlinResult;

#[path = "dispatch/parse_numbers.rs"]
mod parse_numbers;
#[path = "dispatch/expire.rs"]
mod expire;
#[path = "dispatch/set_generic.rs"]
mod set_generic;
#[path = "dispatch/rmw.rs"]
mod rmw;
#[path = "dispatch/handlers_string.rs"]
mod handlers_string;
#[path = "dispatch/handlers_counter.rs"]
mod handlers_counter;
#[path = "dispatch/handlers_bit.rs"]
mod handlers_bit;
#[path = "dispatch/registry.rs"]
mod registry;

pub use registry::CommandRegistry;

/// Shared execution dependencies handed to every command handler.
#[derive(Clone)]
pub struct DispatchContext {
    /// Segment router resolving keys to stores and owning the key lock table.
    pub router: Arc<SegmentRouter>,
    /// Upper bound on optimistic commit attempts per command.
    pub retry_count: u32,
}

impl DispatchContext {
    /// Builds a context; a zero retry bound is coerced to one attempt.
    #[must_use]
    pub fn new(router: Arc<SegmentRouter>, retry_count: u32) -> Self {
        Self {
            router,
            retry_count: retry_count.max(1),
        }
    }
}

/// Handler function signature used by command registry entries.
pub type CommandHandler = fn(&Session, &DispatchContext) -> MarlinResult<CommandReply>;

/// Metadata and callback for one command table entry.
///
/// `arity` counts the command name itself; a negative value means "at least |arity|"
/// arguments. `first_key`/`last_key`/`key_step` describe key positions in the argument
/// vector, with a negative `last_key` counted from the end.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Canonical uppercase command name.
    pub name: &'static str,
    /// Arity constraint, command name included.
    pub arity: i64,
    /// Index of the first key argument, 0 when the command takes no keys.
    pub first_key: i32,
    /// Index of the last key argument, negative counted from the end.
    pub last_key: i32,
    /// Stride between key positions.
    pub key_step: i32,
    /// Handler callback.
    pub handler: CommandHandler,
}

#[cfg(test)]
#[path = "dispatch/tests.rs"]
mod tests;
