use hashbrown::HashMap;
use marlin_common::error::{MarlinError, MarlinResult};

use super::handlers_bit::{handle_bitcount, handle_bitop, handle_bitpos, handle_setbit};
use super::handlers_counter::{
    handle_decr, handle_decrby, handle_incr, handle_incrby, handle_incrbyfloat,
};
use super::handlers_string::{
    handle_append, handle_cas, handle_get, handle_getrange, handle_getset, handle_getvsn,
    handle_mget, handle_mset, handle_not_supported, handle_psetex, handle_set, handle_setex,
    handle_setnx, handle_setrange, handle_strlen,
};
use super::{CommandSpec, DispatchContext};
use crate::command::{CommandReply, Session};

/// Runtime command registry.
///
/// Populated explicitly at process startup; there is no static registration.
#[derive(Debug, Clone, Default)]
pub struct CommandRegistry {
    entries: HashMap<String, CommandSpec>,
}

impl CommandRegistry {
    /// Builds an empty command registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Builds a registry preloaded with the full string command surface.
    #[must_use]
    pub fn with_builtin_commands() -> Self {
        let mut registry = Self::new();
        registry.register_set_commands();
        registry.register_read_commands();
        registry.register_mutation_commands();
        registry.register_bit_commands();
        registry.register_counter_commands();
        registry.register_unsupported_commands();
        registry
    }

    fn register_set_commands(&mut self) {
        self.register(CommandSpec {
            name: "SET",
            arity: -3,
            first_key: 1,
            last_key: 1,
            key_step: 1,
            handler: handle_set,
        });
        self.register(CommandSpec {
            name: "SETEX",
            arity: 4,
            first_key: 1,
            last_key: 1,
            key_step: 1,
            handler: handle_setex,
        });
        self.register(CommandSpec {
            name: "PSETEX",
            arity: 4,
            first_key: 1,
            last_key: 1,
            key_step: 1,
            handler: handle_psetex,
        });
        self.register(CommandSpec {
            name: "SETNX",
            arity: 3,
            first_key: 1,
            last_key: 1,
            key_step: 1,
            handler: handle_setnx,
        });
        self.register(CommandSpec {
            name: "MSET",
            arity: -3,
            first_key: 1,
            last_key: -1,
            key_step: 2,
            handler: handle_mset,
        });
    }

    fn register_read_commands(&mut self) {
        self.register(CommandSpec {
            name: "GET",
            arity: 2,
            first_key: 1,
            last_key: 1,
            key_step: 1,
            handler: handle_get,
        });
        self.register(CommandSpec {
            name: "GETVSN",
            arity: 2,
            first_key: 1,
            last_key: 1,
            key_step: 1,
            handler: handle_getvsn,
        });
        self.register(CommandSpec {
            name: "GETRANGE",
            arity: 4,
            first_key: 1,
            last_key: 1,
            key_step: 1,
            handler: handle_getrange,
        });
        self.register(CommandSpec {
            name: "SUBSTR",
            arity: 4,
            first_key: 1,
            last_key: 1,
            key_step: 1,
            handler: handle_getrange,
        });
        self.register(CommandSpec {
            name: "STRLEN",
            arity: 2,
            first_key: 1,
            last_key: 1,
            key_step: 1,
            handler: handle_strlen,
        });
        self.register(CommandSpec {
            name: "MGET",
            arity: -2,
            first_key: 1,
            last_key: -1,
            key_step: 1,
            handler: handle_mget,
        });
    }

    fn register_mutation_commands(&mut self) {
        self.register(CommandSpec {
            name: "APPEND",
            arity: 3,
            first_key: 1,
            last_key: 1,
            key_step: 1,
            handler: handle_append,
        });
        self.register(CommandSpec {
            name: "SETRANGE",
            arity: 4,
            first_key: 1,
            last_key: 1,
            key_step: 1,
            handler: handle_setrange,
        });
        self.register(CommandSpec {
            name: "GETSET",
            arity: 3,
            first_key: 1,
            last_key: 1,
            key_step: 1,
            handler: handle_getset,
        });
        self.register(CommandSpec {
            name: "CAS",
            arity: 4,
            first_key: 1,
            last_key: 1,
            key_step: 1,
            handler: handle_cas,
        });
    }

    fn register_bit_commands(&mut self) {
        self.register(CommandSpec {
            name: "SETBIT",
            arity: 4,
            first_key: 1,
            last_key: 1,
            key_step: 1,
            handler: handle_setbit,
        });
        self.register(CommandSpec {
            name: "BITCOUNT",
            arity: -2,
            first_key: 1,
            last_key: 1,
            key_step: 1,
            handler: handle_bitcount,
        });
        self.register(CommandSpec {
            name: "BITPOS",
            arity: -3,
            first_key: 1,
            last_key: 1,
            key_step: 1,
            handler: handle_bitpos,
        });
        self.register(CommandSpec {
            name: "BITOP",
            arity: -4,
            first_key: 2,
            last_key: -1,
            key_step: 1,
            handler: handle_bitop,
        });
    }

    fn register_counter_commands(&mut self) {
        self.register(CommandSpec {
            name: "INCR",
            arity: 2,
            first_key: 1,
            last_key: 1,
            key_step: 1,
            handler: handle_incr,
        });
        self.register(CommandSpec {
            name: "DECR",
            arity: 2,
            first_key: 1,
            last_key: 1,
            key_step: 1,
            handler: handle_decr,
        });
        self.register(CommandSpec {
            name: "INCRBY",
            arity: 3,
            first_key: 1,
            last_key: 1,
            key_step: 1,
            handler: handle_incrby,
        });
        self.register(CommandSpec {
            name: "DECRBY",
            arity: 3,
            first_key: 1,
            last_key: 1,
            key_step: 1,
            handler: handle_decrby,
        });
        self.register(CommandSpec {
            name: "INCRBYFLOAT",
            arity: 3,
            first_key: 1,
            last_key: 1,
            key_step: 1,
            handler: handle_incrbyfloat,
        });
    }

    fn register_unsupported_commands(&mut self) {
        self.register(CommandSpec {
            name: "MOVE",
            arity: 3,
            first_key: 1,
            last_key: 1,
            key_step: 1,
            handler: handle_not_supported,
        });
        self.register(CommandSpec {
            name: "RENAME",
            arity: 3,
            first_key: 1,
            last_key: 2,
            key_step: 1,
            handler: handle_not_supported,
        });
        self.register(CommandSpec {
            name: "RENAMENX",
            arity: 3,
            first_key: 1,
            last_key: 2,
            key_step: 1,
            handler: handle_not_supported,
        });
    }

    /// Registers or replaces one command in the table.
    pub fn register(&mut self, spec: CommandSpec) {
        let _ = self.entries.insert(spec.name.to_owned(), spec);
    }

    /// Looks up the table entry for one command name, case-insensitively.
    #[must_use]
    pub fn lookup(&self, name: &[u8]) -> Option<&CommandSpec> {
        let name = String::from_utf8_lossy(name).to_ascii_uppercase();
        self.entries.get(&name)
    }

    /// Validates command existence and arity without executing handler logic.
    ///
    /// # Errors
    ///
    /// Returns `MarlinError::ParsePkt` for unknown command names or invalid argument
    /// count.
    pub fn validate(&self, args: &[Vec<u8>]) -> MarlinResult<&CommandSpec> {
        let Some(first) = args.first() else {
            return Err(MarlinError::ParsePkt("empty command".to_owned()));
        };
        let Some(spec) = self.lookup(first) else {
            return Err(MarlinError::ParsePkt(format!(
                "unknown command '{}'",
                String::from_utf8_lossy(first)
            )));
        };

        let argc = i64::try_from(args.len()).unwrap_or(i64::MAX);
        let valid = if spec.arity >= 0 {
            argc == spec.arity
        } else {
            argc >= -spec.arity
        };
        if !valid {
            return Err(MarlinError::ParsePkt(format!(
                "wrong number of arguments for '{}' command",
                spec.name.to_ascii_lowercase()
            )));
        }
        Ok(spec)
    }

    /// Extracts the key arguments of one command from its dispatch metadata, without
    /// running the command. Used for lock acquisition planning.
    ///
    /// # Errors
    ///
    /// Returns `MarlinError::ParsePkt` when the command is unknown, the arity is
    /// violated, or the metadata points outside the argument vector.
    pub fn command_keys(&self, args: &[Vec<u8>]) -> MarlinResult<Vec<Vec<u8>>> {
        let spec = self.validate(args)?;
        if spec.first_key <= 0 {
            return Ok(Vec::new());
        }

        let argc = i64::try_from(args.len()).unwrap_or(i64::MAX);
        let last = if spec.last_key < 0 {
            argc + i64::from(spec.last_key)
        } else {
            i64::from(spec.last_key)
        };

        let mut keys = Vec::new();
        let mut index = i64::from(spec.first_key);
        while index <= last {
            let position = usize::try_from(index).map_err(|_| {
                MarlinError::ParsePkt("key position out of range".to_owned())
            })?;
            let Some(key) = args.get(position) else {
                return Err(MarlinError::ParsePkt("key position out of range".to_owned()));
            };
            keys.push(key.clone());
            index += i64::from(spec.key_step);
        }
        Ok(keys)
    }

    /// Dispatches one argument vector to its registered handler.
    ///
    /// All errors surface as `-ERR` replies; `NotFound`/`Expired` never escape the
    /// handlers.
    #[must_use]
    pub fn dispatch(&self, session: &Session, ctx: &DispatchContext) -> CommandReply {
        let spec = match self.validate(session.args()) {
            Ok(spec) => spec,
            Err(error) => return CommandReply::from_error(&error),
        };

        match (spec.handler)(session, ctx) {
            Ok(reply) => reply,
            Err(error) => CommandReply::from_error(&error),
        }
    }
}
