//! Command execution layer over the transactional, sharded, key-locked store.
//!
//! Protocol parsing produces an argument vector, then the [`dispatch::CommandRegistry`]
//! resolves and executes the matching handler against the segment router.

pub mod command;
pub mod dispatch;

pub use command::{CommandReply, Session};
pub use dispatch::{CommandRegistry, CommandSpec, DispatchContext};
