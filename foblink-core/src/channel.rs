//! Secure channel: one link, one session, half-duplex request/response.
//! Drives the read-decode-decrypt-dispatch-encrypt-write cycle and the
//! handshake that precedes it.

use std::time::{Duration, Instant};

use crate::command::{Command, CommandError};
use crate::crypto::{CipherMode, CryptoError, Direction, Session};
use crate::dispatch::{DispatchError, Dispatcher, Response};
use crate::frame::{self, FlowControl, FrameError, MAX_PAYLOAD};
use crate::handshake::{
    self, EphemeralKeypair, KeyExchangeError, HANDSHAKE_INIT, HANDSHAKE_PAYLOAD_LEN,
    HANDSHAKE_REPLY,
};
use crate::link::Link;
use crate::status::StatusCode;

/// Per-connection protocol parameters. One configurable protocol instead of
/// per-deployment forks: the cipher discipline, the payload cap and the ack
/// policy are all explicit here.
#[derive(Debug, Clone, Copy)]
pub struct ProtocolConfig {
    pub cipher_mode: CipherMode,
    /// Payload cap for command frames. The clear handshake frames carry
    /// fixed-size key material and use their own exact size as the cap.
    pub max_payload: usize,
    /// Byte-level flow control (off by default).
    pub flow: FlowControl,
    /// Whether an ack byte follows every accepted frame.
    pub frame_ack: bool,
    /// Deadline for reading one frame or ack.
    pub read_timeout: Duration,
    /// Deadline for a matching response to an outbound request.
    pub response_timeout: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            cipher_mode: CipherMode::ChaCha20Poly1305,
            max_payload: MAX_PAYLOAD,
            flow: FlowControl::default(),
            frame_ack: true,
            read_timeout: Duration::from_secs(1),
            response_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    KeyExchange(#[from] KeyExchangeError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("no session established on this channel")]
    NotEstablished,
}

/// One end of a secured link. Exactly one session at a time; re-handshaking
/// replaces it and a failed handshake closes the link.
pub struct SecureChannel<L: Link> {
    link: L,
    config: ProtocolConfig,
    session: Option<Session>,
    binding: Option<[u8; 32]>,
}

impl<L: Link> SecureChannel<L> {
    pub fn new(link: L, config: ProtocolConfig) -> Self {
        Self {
            link,
            config,
            session: None,
            binding: None,
        }
    }

    pub fn is_established(&self) -> bool {
        self.session.is_some()
    }

    /// Transcript binding of the current session, for session-scoped tokens.
    pub fn binding(&self) -> Option<&[u8; 32]> {
        self.binding.as_ref()
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Drop the session (zeroing its keys) and close the link. Any blocked
    /// peer read observes the broken stream immediately.
    pub fn close(&mut self) {
        self.session = None;
        self.binding = None;
        self.link.close();
    }

    fn write_clear(&mut self, payload: &[u8], cap: usize) -> Result<(), ChannelError> {
        frame::write_frame(
            &mut self.link,
            payload,
            cap,
            self.config.flow,
            self.config.read_timeout,
        )?;
        if self.config.frame_ack {
            frame::expect_ack(&mut self.link, Instant::now() + self.config.read_timeout)?;
        }
        Ok(())
    }

    fn read_clear(&mut self, cap: usize, timeout: Duration) -> Result<Vec<u8>, ChannelError> {
        let payload = frame::read_frame(&mut self.link, cap, self.config.flow, timeout)?;
        if self.config.frame_ack {
            frame::send_ack(&mut self.link)?;
        }
        Ok(payload)
    }

    /// Run the handshake as the connecting side. On any key-exchange failure
    /// the link is closed and no session exists.
    pub fn establish_initiator(&mut self, car_id: u32) -> Result<(), ChannelError> {
        self.session = None;
        self.binding = None;
        let keypair = EphemeralKeypair::generate();
        let iv_init = handshake::generate_iv();
        let hello =
            handshake::encode_handshake(HANDSHAKE_INIT, &keypair.public_bytes(), &iv_init);
        self.write_clear(&hello, HANDSHAKE_PAYLOAD_LEN)?;
        let reply = self.read_clear(HANDSHAKE_PAYLOAD_LEN, self.config.response_timeout)?;

        let derived = handshake::parse_handshake(HANDSHAKE_REPLY, &reply).and_then(
            |(point, iv_resp)| {
                let shared = handshake::derive_shared_secret(&keypair, &point)?;
                Ok((
                    handshake::derive_session_key(&shared, &iv_init, &iv_resp),
                    iv_resp,
                ))
            },
        );
        let (key, iv_resp) = match derived {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "handshake failed, closing link");
                self.link.close();
                return Err(e.into());
            }
        };
        self.install_session(key, car_id, Direction::Initiator, iv_init, iv_resp)
    }

    /// Run the handshake as the accepting side.
    pub fn establish_responder(&mut self, car_id: u32) -> Result<(), ChannelError> {
        self.session = None;
        self.binding = None;
        let hello = self.read_clear(HANDSHAKE_PAYLOAD_LEN, self.config.response_timeout)?;

        let keypair = EphemeralKeypair::generate();
        let derived = handshake::parse_handshake(HANDSHAKE_INIT, &hello).and_then(
            |(point, iv_init)| {
                let shared = handshake::derive_shared_secret(&keypair, &point)?;
                Ok((shared, iv_init))
            },
        );
        let (shared, iv_init) = match derived {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "handshake failed, closing link");
                self.link.close();
                return Err(e.into());
            }
        };
        let iv_resp = handshake::generate_iv();
        let reply =
            handshake::encode_handshake(HANDSHAKE_REPLY, &keypair.public_bytes(), &iv_resp);
        self.write_clear(&reply, HANDSHAKE_PAYLOAD_LEN)?;
        let key = handshake::derive_session_key(&shared, &iv_init, &iv_resp);
        self.install_session(key, car_id, Direction::Responder, iv_init, iv_resp)
    }

    fn install_session(
        &mut self,
        key: [u8; 32],
        car_id: u32,
        role: Direction,
        iv_init: [u8; 16],
        iv_resp: [u8; 16],
    ) -> Result<(), ChannelError> {
        let session = Session::new(
            self.config.cipher_mode,
            key,
            car_id,
            role,
            &iv_init,
            &iv_resp,
        )?;
        self.binding = Some(handshake::session_binding(&iv_init, &iv_resp));
        self.session = Some(session);
        tracing::debug!(?role, "session established");
        Ok(())
    }

    /// Seal and send one command frame, then block on the frame ack.
    pub fn send(&mut self, cmd: &Command) -> Result<(), ChannelError> {
        let plaintext = cmd.encode()?;
        let session = self.session.as_mut().ok_or(ChannelError::NotEstablished)?;
        let sealed = session.seal(&plaintext)?;
        frame::write_frame(
            &mut self.link,
            &sealed,
            self.config.max_payload,
            self.config.flow,
            self.config.read_timeout,
        )?;
        if self.config.frame_ack {
            frame::expect_ack(&mut self.link, Instant::now() + self.config.read_timeout)?;
        }
        Ok(())
    }

    /// Receive and open one command frame within `timeout`.
    fn recv_within(&mut self, timeout: Duration) -> Result<Command, ChannelError> {
        if self.session.is_none() {
            return Err(ChannelError::NotEstablished);
        }
        let sealed = frame::read_frame(
            &mut self.link,
            self.config.max_payload,
            self.config.flow,
            timeout,
        )?;
        if self.config.frame_ack {
            frame::send_ack(&mut self.link)?;
        }
        let session = self.session.as_mut().ok_or(ChannelError::NotEstablished)?;
        let plaintext = session.open(&sealed)?;
        Ok(Command::parse(&plaintext)?)
    }

    /// Receive one inbound command with the standing read deadline.
    pub fn recv(&mut self) -> Result<Command, ChannelError> {
        self.recv_within(self.config.read_timeout)
    }

    /// Send a request and block for exactly one matching response. A single
    /// attempt: on deadline the caller gets `DispatchError::Timeout` and
    /// decides whether to reattempt.
    pub fn request(&mut self, cmd: &Command) -> Result<Response, ChannelError> {
        self.send(cmd)?;
        let reply = match self.recv_within(self.config.response_timeout) {
            Ok(reply) => reply,
            Err(ChannelError::Frame(FrameError::Timeout)) => {
                return Err(DispatchError::Timeout.into())
            }
            Err(e) => return Err(e),
        };
        Ok(Response::from_command(&reply)?)
    }

    /// Serve one inbound command: receive, dispatch, reply. Unknown commands
    /// answer with a status instead of tearing the link down.
    pub fn serve_one<C>(
        &mut self,
        dispatcher: &mut Dispatcher<C>,
        ctx: &mut C,
    ) -> Result<u8, ChannelError> {
        let cmd = self.recv()?;
        let response = match dispatcher.dispatch(ctx, &cmd) {
            Ok(response) => response,
            Err(e @ DispatchError::UnknownCommand(_)) => {
                tracing::debug!(code = cmd.code, "unknown command");
                Response::Nack(StatusCode::from(&e))
            }
            Err(e) => return Err(e.into()),
        };
        self.send(&response.to_command())?;
        Ok(cmd.code)
    }
}
