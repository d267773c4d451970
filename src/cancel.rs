//! Cooperative cancellation for blocking network work.
//!
//! A [`CancelToken`] is cheap to clone and shared between the caller of a
//! search and every session it opens. Sessions register their socket with the
//! token; [`CancelToken::cancel`] shuts every registered socket down, so a
//! thread blocked in `read` wakes up immediately instead of waiting out its
//! timeout.

use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    next_id: AtomicU64,
    streams: Mutex<Vec<(u64, TcpStream)>>,
}

impl Inner {
    fn streams(&self) -> MutexGuard<'_, Vec<(u64, TcpStream)>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared cancellation flag that also aborts registered sockets.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    /// A fresh, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        for (_, stream) in self.inner.streams().drain(..) {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Register a socket so cancellation shuts it down.
    ///
    /// If the token is already cancelled the socket is shut down at once. The
    /// registration lasts until the returned guard is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket handle cannot be cloned.
    pub fn register(&self, stream: &TcpStream) -> std::io::Result<Registration> {
        let clone = stream.try_clone()?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut streams = self.inner.streams();
            // Checked under the lock so a concurrent cancel cannot miss us.
            if self.is_cancelled() {
                let _ = clone.shutdown(Shutdown::Both);
            } else {
                streams.push((id, clone));
            }
        }
        Ok(Registration {
            token: self.clone(),
            id,
        })
    }

    #[cfg(test)]
    fn registered(&self) -> usize {
        self.inner.streams().len()
    }
}

/// Keeps a socket registered with a [`CancelToken`] while alive.
#[derive(Debug)]
pub struct Registration {
    token: CancelToken,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.token
            .inner
            .streams()
            .retain(|(id, _)| *id != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;
    use std::thread;
    use std::time::{Duration, Instant};

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_cancel_wakes_blocked_reader() {
        let (mut client, _server) = connected_pair();
        let token = CancelToken::new();
        let _registration = token.register(&client).unwrap();

        let canceller = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            canceller.cancel();
        });

        let started = Instant::now();
        let mut buf = [0u8; 16];
        let read = client.read(&mut buf);
        assert!(matches!(read, Ok(0) | Err(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(token.is_cancelled());
        handle.join().unwrap();
    }

    #[test]
    fn test_register_after_cancel_shuts_down() {
        let (mut client, _server) = connected_pair();
        let token = CancelToken::new();
        token.cancel();
        let _registration = token.register(&client).unwrap();
        let mut buf = [0u8; 1];
        assert!(matches!(client.read(&mut buf), Ok(0) | Err(_)));
        assert_eq!(token.registered(), 0);
    }

    #[test]
    fn test_registration_dropped_unregisters() {
        let (client, _server) = connected_pair();
        let token = CancelToken::new();
        {
            let _registration = token.register(&client).unwrap();
            assert_eq!(token.registered(), 1);
        }
        assert_eq!(token.registered(), 0);
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }
}
