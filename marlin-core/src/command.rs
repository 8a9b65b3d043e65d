//! Session context and canonical command reply types.

use marlin_common::error::MarlinError;
use marlin_common::ids::DbId;

/// Per-invocation command context: the selected logical database and the parsed
/// argument vector, command name at index 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    db_id: DbId,
    args: Vec<Vec<u8>>,
}

impl Session {
    /// Creates a session context for one command invocation.
    #[must_use]
    pub fn new(db_id: DbId, args: Vec<Vec<u8>>) -> Self {
        Self { db_id, args }
    }

    /// Selected logical database id.
    #[must_use]
    pub fn db_id(&self) -> DbId {
        self.db_id
    }

    /// Full argument vector, command name included.
    #[must_use]
    pub fn args(&self) -> &[Vec<u8>] {
        &self.args
    }
}

/// Canonical command reply representation.
///
/// The reply enum is kept protocol-neutral; encoding to RESP happens at the server
/// boundary, so command logic stays independent from wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandReply {
    /// `+OK` style replies.
    SimpleString(String),
    /// `$<len> ...` style binary-safe payload.
    BulkString(Vec<u8>),
    /// RESP null bulk string (`$-1`).
    Null,
    /// RESP integer reply (`:<n>`).
    Integer(i64),
    /// RESP array reply (`*<n> ...`).
    Array(Vec<CommandReply>),
    /// `-ERR ...` style error.
    Error(String),
}

impl CommandReply {
    /// The default success reply.
    #[must_use]
    pub fn ok() -> Self {
        Self::SimpleString("OK".to_owned())
    }

    /// Integer one.
    #[must_use]
    pub fn one() -> Self {
        Self::Integer(1)
    }

    /// Integer zero.
    #[must_use]
    pub fn zero() -> Self {
        Self::Integer(0)
    }

    /// Maps an error into the client-facing `-ERR` reply.
    #[must_use]
    pub fn from_error(error: &MarlinError) -> Self {
        Self::Error(error.to_string())
    }

    /// Encodes the reply into RESP bytes for Redis-compatible clients.
    #[must_use]
    pub fn to_resp_bytes(&self) -> Vec<u8> {
        match self {
            Self::SimpleString(value) => {
                let mut output = Vec::with_capacity(value.len() + 3);
                output.extend_from_slice(b"+");
                output.extend_from_slice(value.as_bytes());
                output.extend_from_slice(b"\r\n");
                output
            }
            Self::BulkString(value) => {
                let mut output = Vec::new();
                output.extend_from_slice(format!("${}\r\n", value.len()).as_bytes());
                output.extend_from_slice(value);
                output.extend_from_slice(b"\r\n");
                output
            }
            Self::Null => b"$-1\r\n".to_vec(),
            Self::Integer(value) => format!(":{value}\r\n").into_bytes(),
            Self::Array(items) => {
                let mut output = format!("*{}\r\n", items.len()).into_bytes();
                for item in items {
                    output.extend_from_slice(&item.to_resp_bytes());
                }
                output
            }
            Self::Error(message) => {
                let mut output = Vec::with_capacity(message.len() + 6);
                output.extend_from_slice(b"-ERR ");
                output.extend_from_slice(message.as_bytes());
                output.extend_from_slice(b"\r\n");
                output
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::CommandReply;
    use googletest::prelude::*;
    use marlin_common::error::MarlinError;
    use rstest::rstest;

    #[rstest]
    #[case(CommandReply::ok(), b"+OK\r\n".to_vec())]
    #[case(CommandReply::Null, b"$-1\r\n".to_vec())]
    #[case(CommandReply::Integer(-1), b":-1\r\n".to_vec())]
    #[case(CommandReply::BulkString(b"hello".to_vec()), b"$5\r\nhello\r\n".to_vec())]
    #[case(
        CommandReply::Array(vec![CommandReply::Integer(7), CommandReply::Null]),
        b"*2\r\n:7\r\n$-1\r\n".to_vec()
    )]
    fn resp_encoding_matches_wire_format(#[case] reply: CommandReply, #[case] wire: Vec<u8>) {
        assert_that!(reply.to_resp_bytes(), eq(&(wire)));
    }

    #[rstest]
    fn errors_render_with_err_prefix() {
        let reply =
            CommandReply::from_error(&MarlinError::Cas("cas unmatch".to_owned()));
        assert_that!(reply.to_resp_bytes(), eq(&(b"-ERR cas unmatch\r\n".to_vec())));
    }
}
