//! TCP implementation of the core link trait.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use foblink_core::link::{Link, LinkError};

pub struct TcpLink {
    stream: TcpStream,
}

impl TcpLink {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }
}

impl Link for TcpLink {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, LinkError> {
        if timeout.is_zero() {
            return Err(LinkError::Timeout(timeout));
        }
        self.stream
            .set_read_timeout(Some(timeout))
            .map_err(|e| LinkError::Io(e.to_string()))?;
        match self.stream.read(buf) {
            Ok(0) => Err(LinkError::Closed),
            Ok(n) => Ok(n),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Err(LinkError::Timeout(timeout))
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::ConnectionReset
                    || e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                Err(LinkError::Closed)
            }
            Err(e) => Err(LinkError::Io(e.to_string())),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<(), LinkError> {
        match self.stream.write_all(buf) {
            Ok(()) => Ok(()),
            Err(e)
                if e.kind() == std::io::ErrorKind::BrokenPipe
                    || e.kind() == std::io::ErrorKind::ConnectionReset =>
            {
                Err(LinkError::Closed)
            }
            Err(e) => Err(LinkError::Io(e.to_string())),
        }
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
