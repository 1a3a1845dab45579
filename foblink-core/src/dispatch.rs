//! Command dispatch: a fixed 256-entry handler table keyed by command byte.
//! Handlers produce a [`Response`]; unknown codes surface as an error the
//! channel converts into a negative status for the peer.

use crate::command::{Command, CommandCode};
use crate::status::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown command {0:#04x}")]
    UnknownCommand(u8),
    #[error("no matching response within the timeout")]
    Timeout,
    #[error("handler already registered for {0:#04x}")]
    DuplicateHandler(u8),
    #[error("peer reply was not a response")]
    BadResponse,
}

/// Outcome of one handled command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Positive reply with handler-defined data.
    Ack(Vec<u8>),
    /// Negative reply carrying a status code.
    Nack(StatusCode),
}

impl Response {
    pub fn nack(status: StatusCode) -> Self {
        Response::Nack(status)
    }

    /// Serialize into a command for the wire.
    pub fn to_command(&self) -> Command {
        match self {
            Response::Ack(data) => Command::new(CommandCode::Ack, data.clone()),
            Response::Nack(status) => {
                Command::new(CommandCode::Nack, status.0.to_be_bytes().to_vec())
            }
        }
    }

    /// Interpret a received command as a response. Anything that is not an
    /// ack or a well-formed nack is a protocol violation.
    pub fn from_command(cmd: &Command) -> Result<Self, DispatchError> {
        match CommandCode::from_byte(cmd.code) {
            Some(CommandCode::Ack) => Ok(Response::Ack(cmd.data.clone())),
            Some(CommandCode::Nack) => {
                if cmd.data.len() < 2 {
                    return Err(DispatchError::BadResponse);
                }
                Ok(Response::Nack(StatusCode(u16::from_be_bytes([
                    cmd.data[0],
                    cmd.data[1],
                ]))))
            }
            _ => Err(DispatchError::BadResponse),
        }
    }
}

/// A registered command handler. Gets the per-connection context and the
/// command data, returns the reply.
pub trait Handler<C> {
    fn handle(&mut self, ctx: &mut C, data: &[u8]) -> Response;
}

impl<C, F> Handler<C> for F
where
    F: FnMut(&mut C, &[u8]) -> Response,
{
    fn handle(&mut self, ctx: &mut C, data: &[u8]) -> Response {
        self(ctx, data)
    }
}

/// Fixed dispatch table. Codes resolve by direct index; there is no dynamic
/// name lookup anywhere in the path.
pub struct Dispatcher<C> {
    table: Vec<Option<Box<dyn Handler<C> + Send>>>,
}

impl<C> Dispatcher<C> {
    pub fn new() -> Self {
        let mut table = Vec::with_capacity(256);
        table.resize_with(256, || None);
        Self { table }
    }

    /// Install a handler for one command code. Each code gets exactly one.
    pub fn register<H>(&mut self, code: CommandCode, handler: H) -> Result<(), DispatchError>
    where
        H: Handler<C> + Send + 'static,
    {
        let idx = code as u8 as usize;
        if self.table[idx].is_some() {
            return Err(DispatchError::DuplicateHandler(code as u8));
        }
        self.table[idx] = Some(Box::new(handler));
        Ok(())
    }

    /// Look up and run the handler for an inbound command.
    pub fn dispatch(&mut self, ctx: &mut C, cmd: &Command) -> Result<Response, DispatchError> {
        match self.table[cmd.code as usize].as_mut() {
            Some(handler) => Ok(handler.handle(ctx, &cmd.data)),
            None => Err(DispatchError::UnknownCommand(cmd.code)),
        }
    }
}

impl<C> Default for Dispatcher<C> {
    fn default() -> Self {
        Self::new()
    }
}
