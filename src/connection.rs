//! Connection cache: at most one outbound TCP stream per peer pid.
//!
//! Concurrent sends to the same peer must coalesce onto a single connect
//! attempt; everyone waiting gets the same stream once it's ready (or the
//! same error if the connect fails). This mirrors `Context.maybe_connect`'s
//! pending-callback queue, translated from Python's single-threaded
//! callback queue into a `tokio::sync::Mutex`-guarded map plus a
//! `broadcast`-style one-shot fan-out.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};

use crate::error::Error;
use crate::link::LinkMonitor;
use crate::pid::Pid;
use crate::scheduler::Scheduler;
use crate::wire::{encode_request, OutboundRequest, RequestDecoder};

/// A live outbound connection to one peer. Writes are serialized through
/// `write_half`; the read side is driven by a background task that only
/// exists to detect the peer closing the stream (libprocess connections
/// carry no inbound data on the outbound leg other than EOF).
pub struct OutboundConnection {
    peer: Pid,
    write_half: Mutex<OwnedWriteHalf>,
}

impl std::fmt::Debug for OutboundConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundConnection")
            .field("peer", &self.peer)
            .finish()
    }
}

impl OutboundConnection {
    pub async fn write(&self, bytes: &[u8]) -> Result<(), Error> {
        let mut guard = self.write_half.lock().await;
        guard.write_all(bytes).await.map_err(Error::SocketError)
    }

    /// Half-close the write side. The peer observes EOF, and this
    /// connection's read-monitor task (which is what actually removes the
    /// entry from the cache and notifies the link monitor) unblocks and
    /// tears itself down.
    pub async fn shutdown(&self) {
        let mut guard = self.write_half.lock().await;
        let _ = guard.shutdown().await;
    }
}

type ReadyCallback = oneshot::Sender<Result<Arc<OutboundConnection>, String>>;

#[derive(Default)]
struct State {
    connections: HashMap<Pid, Arc<OutboundConnection>>,
    pending: HashMap<Pid, Vec<ReadyCallback>>,
}

/// Shared cache of outbound connections, one per peer.
#[derive(Clone)]
pub struct ConnectionCache {
    state: Arc<Mutex<State>>,
    scheduler: Scheduler,
    link_monitor: LinkMonitor,
}

impl std::fmt::Debug for ConnectionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCache").finish()
    }
}

impl ConnectionCache {
    pub fn new(scheduler: Scheduler, link_monitor: LinkMonitor) -> Self {
        ConnectionCache {
            state: Arc::new(Mutex::new(State::default())),
            scheduler,
            link_monitor,
        }
    }

    /// Get (connecting if necessary) the stream to `peer`. Concurrent
    /// callers for the same peer share one connect attempt.
    pub async fn get_stream(&self, peer: Pid) -> Result<Arc<OutboundConnection>, Error> {
        let mut should_connect = false;
        let rx = {
            let mut state = self.state.lock().await;
            if let Some(conn) = state.connections.get(&peer) {
                return Ok(conn.clone());
            }
            let (tx, rx) = oneshot::channel();
            match state.pending.get_mut(&peer) {
                Some(waiters) => waiters.push(tx),
                None => {
                    state.pending.insert(peer.clone(), vec![tx]);
                    should_connect = true;
                }
            }
            rx
        };

        if should_connect {
            self.connect_and_notify(peer.clone()).await;
        }

        rx.await
            .map_err(|_| Error::SocketError(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "connection attempt dropped",
            )))?
            .map_err(|e| Error::SocketError(std::io::Error::new(std::io::ErrorKind::Other, e)))
    }

    async fn connect_and_notify(&self, peer: Pid) {
        let result = TcpStream::connect((peer.ip, peer.port)).await;
        let outcome: Result<Arc<OutboundConnection>, String> = match result {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                let (read_half, write_half) = stream.into_split();
                let conn = Arc::new(OutboundConnection {
                    peer: peer.clone(),
                    write_half: Mutex::new(write_half),
                });
                self.spawn_read_monitor(peer.clone(), read_half);
                {
                    let mut state = self.state.lock().await;
                    state.connections.insert(peer.clone(), conn.clone());
                }
                Ok(conn)
            }
            Err(e) => Err(e.to_string()),
        };

        let waiters = {
            let mut state = self.state.lock().await;
            state.pending.remove(&peer).unwrap_or_default()
        };
        for waiter in waiters {
            let _ = waiter.send(match &outcome {
                Ok(conn) => Ok(conn.clone()),
                Err(e) => Err(e.clone()),
            });
        }

        if let Err(e) = &outcome {
            log::warn!("connect to {peer} failed: {e}");
            self.link_monitor.notify_exited(&peer);
        }
    }

    /// A background task that just drains the read side until EOF or error,
    /// then removes the connection from the cache and notifies the link
    /// monitor. The wire protocol never expects data back on an outbound
    /// connection; only its closure is meaningful.
    fn spawn_read_monitor(&self, peer: Pid, mut read_half: tokio::net::tcp::OwnedReadHalf) {
        let state = self.state.clone();
        let link_monitor = self.link_monitor.clone();
        self.scheduler.schedule(async move {
            use tokio::io::AsyncReadExt;
            let mut decoder = RequestDecoder::new();
            let mut buf = [0u8; 4096];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        // Any bytes on an outbound leg are unexpected; drain
                        // them through the decoder so a misbehaving peer
                        // can't wedge the loop, but ignore the result.
                        let _ = decoder.feed(&buf[..n]);
                    }
                    Err(_) => break,
                }
            }
            let mut state = state.lock().await;
            state.connections.remove(&peer);
            drop(state);
            link_monitor.notify_exited(&peer);
        });
    }

    /// Build and send a request to `peer`, coalescing on the shared
    /// connection. `content_type` is only meaningful for non-empty bodies.
    pub async fn send_request(
        &self,
        from: Pid,
        peer: Pid,
        path: String,
        body: bytes::Bytes,
        content_type: Option<String>,
        legacy: bool,
    ) -> Result<(), Error> {
        let conn = self.get_stream(peer).await?;
        let req = OutboundRequest {
            method: "POST".into(),
            path,
            from,
            content_type,
            body,
            legacy,
        };
        conn.write(&encode_request(&req)).await
    }

    /// Close every currently cached outbound connection. Used by
    /// `Context::stop` to tear the cache down; the connections remove
    /// themselves from the cache (and notify the link monitor) via their
    /// own read-monitor tasks once the shutdown is observed as an EOF.
    pub async fn close_all(&self) {
        let conns: Vec<Arc<OutboundConnection>> = {
            let state = self.state.lock().await;
            state.connections.values().cloned().collect()
        };
        for conn in conns {
            conn.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn coalesces_concurrent_connects_into_one_stream() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });

        let sched = Scheduler::from_handle(tokio::runtime::Handle::current());
        let link_monitor = LinkMonitor::new(sched.clone());
        let cache = ConnectionCache::new(sched, link_monitor);
        let peer = Pid::new(
            "peer",
            Ipv4Addr::new(127, 0, 0, 1),
            addr.port(),
        );

        let a = cache.get_stream(peer.clone());
        let b = cache.get_stream(peer.clone());
        let (ra, rb) = tokio::join!(a, b);
        let ra = ra.unwrap();
        let rb = rb.unwrap();
        assert!(Arc::ptr_eq(&ra, &rb));
    }
}
