//! Wire message parsing and building.
//!
//! One message per line.  The line grammar is:
//!
//! ```text
//! message  := [ server '/' ] [ service ':' ] command [ ' ' params ]
//! params   := param { ';' param }
//! param    := name '=' value
//! value    := bare | '"' escaped '"'
//! ```
//!
//! Names are `[A-Za-z0-9_]+`; the command is mandatory.  Values may carry any
//! byte: `\n` and `\r` are always escaped, and a value containing `;` (or
//! starting with `"`) is emitted quoted with interior quotes escaped as `\"`.
//!
//! The serialized form is memoized and invalidated by every mutator, so
//! fanning one message out to many connections serializes it once.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Parameter carrying the name of the server a message was sent from.
pub const PARAM_SENT_FROM_SERVER: &str = "sent_from_server";
/// Parameter carrying the name of the service a message was sent from.
pub const PARAM_SENT_FROM_SERVICE: &str = "sent_from_service";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    /// The input line does not match the message grammar.
    #[error("invalid message: {0}")]
    Invalid(&'static str),
    /// A message cannot be serialized without a command.
    #[error("invalid message: a command is mandatory")]
    MissingCommand,
    /// A name does not match `[A-Za-z0-9_]+`.
    #[error("invalid message: bad name \"{0}\"")]
    BadName(String),
    /// `integer_parameter()` was called on a missing parameter.
    #[error("parameter \"{0}\" is not defined")]
    MissingParameter(String),
    /// `integer_parameter()` was called on a non-numeric value.
    #[error("parameter \"{0}\" is not an integer")]
    NotAnInteger(String),
}

fn is_name(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

// A target service may also be a broadcast marker: `*` (everywhere),
// `?` (nearby daemons), `.` (this node only).
fn is_service_name(s: &str) -> bool {
    is_name(s) || matches!(s, "*" | "?" | ".")
}

// A target server of `*` means "any server".
fn is_server_name(s: &str) -> bool {
    is_name(s) || s == "*"
}

/// One wire message: a command, optional target server and service, and an
/// ordered name/value parameter map.
#[derive(Debug, Clone, Default)]
pub struct Message {
    server: String,
    service: String,
    command: String,
    parameters: BTreeMap<String, String>,
    // Memoized `to_wire()` result; cleared by every mutator.
    cached: RefCell<Option<String>>,
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.server == other.server
            && self.service == other.service
            && self.command == other.command
            && self.parameters == other.parameters
    }
}

impl Eq for Message {}

impl Message {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    /// Parse one line.  The terminating newline must already be stripped.
    ///
    /// On error nothing is returned; the caller is expected to log, drop the
    /// line and keep the connection.
    pub fn from_wire(line: &str) -> Result<Self, MessageError> {
        let (head, params) = match line.find(' ') {
            Some(pos) => (&line[..pos], Some(&line[pos + 1..])),
            None => (line, None),
        };

        let (server, rest) = match head.find('/') {
            Some(pos) => (&head[..pos], &head[pos + 1..]),
            None => ("", head),
        };
        let (service, command) = match rest.find(':') {
            Some(pos) => (&rest[..pos], &rest[pos + 1..]),
            None => ("", rest),
        };

        if !is_name(command) {
            return Err(MessageError::Invalid("command is missing or malformed"));
        }
        if head.contains('/') && !is_server_name(server) {
            return Err(MessageError::Invalid("malformed server name"));
        }
        if rest.contains(':') && !is_service_name(service) {
            return Err(MessageError::Invalid("malformed service name"));
        }

        let mut parameters = BTreeMap::new();
        if let Some(params) = params {
            let mut chars = params.char_indices().peekable();
            while chars.peek().is_some() {
                // Parameter name, up to '='.
                let mut name = String::new();
                let mut saw_equal = false;
                for (_, c) in chars.by_ref() {
                    if c == '=' {
                        saw_equal = true;
                        break;
                    }
                    name.push(c);
                }
                if !saw_equal {
                    return Err(MessageError::Invalid("parameter without '='"));
                }
                if !is_name(&name) {
                    return Err(MessageError::BadName(name));
                }

                // Parameter value, bare or quoted.
                let mut value = String::new();
                if matches!(chars.peek(), Some((_, '"'))) {
                    chars.next();
                    let mut closed = false;
                    while let Some((_, c)) = chars.next() {
                        if c == '"' {
                            closed = true;
                            break;
                        }
                        if c == '\\' && matches!(chars.peek(), Some((_, '"'))) {
                            chars.next();
                            value.push('"');
                        } else {
                            value.push(c);
                        }
                    }
                    if !closed {
                        return Err(MessageError::Invalid("unterminated quoted value"));
                    }
                    // After the closing quote only ';' or end of line is valid.
                    match chars.next() {
                        None => {}
                        Some((_, ';')) => {}
                        Some(_) => {
                            return Err(MessageError::Invalid("garbage after quoted value"));
                        }
                    }
                } else {
                    for (_, c) in chars.by_ref() {
                        if c == ';' {
                            break;
                        }
                        value.push(c);
                    }
                }

                let value = value.replace("\\n", "\n").replace("\\r", "\r");
                parameters.insert(name, value);
            }
        }

        Ok(Self {
            server: server.to_owned(),
            service: service.to_owned(),
            command: command.to_owned(),
            parameters,
            cached: RefCell::new(None),
        })
    }

    /// Serialize to the canonical line form, without the trailing newline.
    ///
    /// The result is cached until the message is mutated, so repeated calls
    /// return byte-identical output at no extra cost.
    pub fn to_wire(&self) -> Result<String, MessageError> {
        if let Some(cached) = self.cached.borrow().as_ref() {
            return Ok(cached.clone());
        }

        if self.command.is_empty() {
            return Err(MessageError::MissingCommand);
        }
        if !is_name(&self.command) {
            return Err(MessageError::BadName(self.command.clone()));
        }

        let mut out = String::new();
        if !self.server.is_empty() {
            if !is_server_name(&self.server) {
                return Err(MessageError::BadName(self.server.clone()));
            }
            out.push_str(&self.server);
            out.push('/');
        }
        if !self.service.is_empty() {
            if !is_service_name(&self.service) {
                return Err(MessageError::BadName(self.service.clone()));
            }
            out.push_str(&self.service);
            out.push(':');
        }
        out.push_str(&self.command);

        for (i, (name, value)) in self.parameters.iter().enumerate() {
            if !is_name(name) {
                return Err(MessageError::BadName(name.clone()));
            }
            out.push(if i == 0 { ' ' } else { ';' });
            out.push_str(name);
            out.push('=');

            let escaped = value.replace('\n', "\\n").replace('\r', "\\r");
            if escaped.contains(';') || escaped.starts_with('"') {
                out.push('"');
                out.push_str(&escaped.replace('"', "\\\""));
                out.push('"');
            } else {
                out.push_str(&escaped);
            }
        }

        *self.cached.borrow_mut() = Some(out.clone());
        Ok(out)
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn set_command(&mut self, command: impl Into<String>) {
        self.command = command.into();
        self.cached.borrow_mut().take();
    }

    /// Target service name; `*`, `?` and `.` select broadcast scopes.
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn set_service(&mut self, service: impl Into<String>) {
        self.service = service.into();
        self.cached.borrow_mut().take();
    }

    /// Target server name; empty or `*` means any server.
    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn set_server(&mut self, server: impl Into<String>) {
        self.server = server.into();
        self.cached.borrow_mut().take();
    }

    pub fn has_parameter(&self, name: &str) -> bool {
        self.parameters.contains_key(name)
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// The parameter as an `i64`, or an error when missing or non-numeric.
    pub fn integer_parameter(&self, name: &str) -> Result<i64, MessageError> {
        let value = self
            .parameters
            .get(name)
            .ok_or_else(|| MessageError::MissingParameter(name.to_owned()))?;
        value
            .parse()
            .map_err(|_| MessageError::NotAnInteger(name.to_owned()))
    }

    pub fn set_parameter(&mut self, name: impl Into<String>, value: impl ToString) {
        self.parameters.insert(name.into(), value.to_string());
        self.cached.borrow_mut().take();
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    pub fn sent_from_server(&self) -> Option<&str> {
        self.parameter(PARAM_SENT_FROM_SERVER)
    }

    pub fn set_sent_from_server(&mut self, server: impl Into<String>) {
        self.set_parameter(PARAM_SENT_FROM_SERVER, server.into());
    }

    pub fn sent_from_service(&self) -> Option<&str> {
        self.parameter(PARAM_SENT_FROM_SERVICE)
    }

    pub fn set_sent_from_service(&mut self, service: impl Into<String>) {
        self.set_parameter(PARAM_SENT_FROM_SERVICE, service.into());
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_wire() {
            Ok(line) => f.write_str(&line),
            Err(_) => f.write_str("<incomplete message>"),
        }
    }
}
