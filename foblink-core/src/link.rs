//! Byte-stream transport abstraction: blocking reads with deadlines, plus an
//! in-process pair for tests. Production transports live in the host crate.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Transport failure observed by the framing layer.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// The peer closed the stream. Pending reads unblock with this.
    #[error("link closed")]
    Closed,
    /// No bytes arrived within the allowed window.
    #[error("read timed out after {0:?}")]
    Timeout(Duration),
    /// Underlying transport failure.
    #[error("transport failure: {0}")]
    Io(String),
}

/// An ordered, reliable byte stream. Reads block until at least one byte is
/// available or `timeout` elapses; partial reads are expected and the caller
/// retries for the remainder. Closing one end unblocks the peer's reads.
pub trait Link {
    /// Read up to `buf.len()` bytes. Returns the number of bytes read (>= 1).
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, LinkError>;

    /// Write the whole buffer.
    fn write_all(&mut self, buf: &[u8]) -> Result<(), LinkError>;

    /// Close both directions. Idempotent.
    fn close(&mut self);
}

struct Pipe {
    buf: VecDeque<u8>,
    closed: bool,
}

type Shared = Arc<(Mutex<Pipe>, Condvar)>;

/// One end of an in-process link. Created with [`memory_pair`].
pub struct MemoryLink {
    rx: Shared,
    tx: Shared,
}

/// Two connected in-memory link ends. What one end writes, the other reads.
pub fn memory_pair() -> (MemoryLink, MemoryLink) {
    let a: Shared = Arc::new((
        Mutex::new(Pipe {
            buf: VecDeque::new(),
            closed: false,
        }),
        Condvar::new(),
    ));
    let b: Shared = Arc::new((
        Mutex::new(Pipe {
            buf: VecDeque::new(),
            closed: false,
        }),
        Condvar::new(),
    ));
    (
        MemoryLink {
            rx: a.clone(),
            tx: b.clone(),
        },
        MemoryLink { rx: b, tx: a },
    )
}

impl MemoryLink {
    /// Bytes queued for this end but not yet read. Test hook.
    pub fn pending(&self) -> usize {
        let (lock, _) = &*self.rx;
        lock.lock().map(|p| p.buf.len()).unwrap_or(0)
    }
}

impl Link for MemoryLink {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, LinkError> {
        let deadline = Instant::now() + timeout;
        let (lock, cvar) = &*self.rx;
        let mut pipe = lock.lock().map_err(|e| LinkError::Io(e.to_string()))?;
        loop {
            if !pipe.buf.is_empty() {
                let n = buf.len().min(pipe.buf.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = pipe.buf.pop_front().unwrap_or(0);
                }
                return Ok(n);
            }
            if pipe.closed {
                return Err(LinkError::Closed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(LinkError::Timeout(timeout));
            }
            let (guard, _) = cvar
                .wait_timeout(pipe, deadline - now)
                .map_err(|e| LinkError::Io(e.to_string()))?;
            pipe = guard;
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<(), LinkError> {
        let (lock, cvar) = &*self.tx;
        let mut pipe = lock.lock().map_err(|e| LinkError::Io(e.to_string()))?;
        if pipe.closed {
            return Err(LinkError::Closed);
        }
        pipe.buf.extend(buf);
        cvar.notify_all();
        Ok(())
    }

    fn close(&mut self) {
        for shared in [&self.rx, &self.tx] {
            let (lock, cvar) = &**shared;
            if let Ok(mut pipe) = lock.lock() {
                pipe.closed = true;
                cvar.notify_all();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const TICK: Duration = Duration::from_millis(50);

    #[test]
    fn write_then_read() {
        let (mut a, mut b) = memory_pair();
        a.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        let n = b.read(&mut buf, TICK).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn partial_read_returns_available() {
        let (mut a, mut b) = memory_pair();
        a.write_all(b"ab").unwrap();
        let mut buf = [0u8; 8];
        let n = b.read(&mut buf, TICK).unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn read_times_out_when_empty() {
        let (_a, mut b) = memory_pair();
        let mut buf = [0u8; 1];
        assert!(matches!(
            b.read(&mut buf, Duration::from_millis(10)),
            Err(LinkError::Timeout(_))
        ));
    }

    #[test]
    fn close_unblocks_pending_read() {
        let (mut a, mut b) = memory_pair();
        let t = std::thread::spawn(move || {
            let mut buf = [0u8; 1];
            b.read(&mut buf, Duration::from_secs(5))
        });
        std::thread::sleep(Duration::from_millis(20));
        a.close();
        assert!(matches!(t.join().unwrap(), Err(LinkError::Closed)));
    }

    #[test]
    fn write_after_close_fails() {
        let (mut a, mut b) = memory_pair();
        b.close();
        assert!(matches!(a.write_all(b"x"), Err(LinkError::Closed)));
    }
}
