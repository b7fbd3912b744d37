//! TCP transport with length-delimited bincode frames
//!
//! Each node dials its own outbound connection to every peer it sends to. The
//! first frame on an outbound connection is [`Frame::Hello`] so the acceptor
//! learns the dialer's cluster address. A peer stays associated while at least
//! one link in either direction is up.

use super::{Transport, TransportEvent};
use crate::error::{ClusterError, Result};
use crate::protocol::PeerMessage;
use crate::topology::NodeAddress;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize, Deserialize)]
enum Frame {
    Hello { from: NodeAddress },
    Message(PeerMessage),
}

fn encode(frame: &Frame) -> Result<Bytes> {
    Ok(Bytes::from(bincode::serialize(frame)?))
}

fn decode(bytes: &[u8]) -> Result<Frame> {
    Ok(bincode::deserialize(bytes)?)
}

struct Outbound {
    id: u64,
    queue: mpsc::UnboundedSender<PeerMessage>,
}

struct TcpInner {
    local: NodeAddress,
    events: mpsc::UnboundedSender<TransportEvent>,
    outbound: Mutex<HashMap<NodeAddress, Outbound>>,
    link_counts: Mutex<HashMap<NodeAddress, usize>>,
    next_link_id: Mutex<u64>,
    cancel: CancellationToken,
}

impl TcpInner {
    fn link_up(&self, peer: &NodeAddress) {
        let mut counts = self.link_counts.lock();
        let count = counts.entry(peer.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            debug!(peer = %peer, "Peer associated");
            let _ = self.events.send(TransportEvent::Associated(peer.clone()));
        }
    }

    fn link_down(&self, peer: &NodeAddress) {
        let mut counts = self.link_counts.lock();
        if let Some(count) = counts.get_mut(peer) {
            *count -= 1;
            if *count == 0 {
                counts.remove(peer);
                debug!(peer = %peer, "Peer disassociated");
                let _ = self.events.send(TransportEvent::Disassociated(peer.clone()));
            }
        }
    }

    /// An outbound dial that never came up. Only reported as a disassociation
    /// when no inbound link from the peer is live either.
    fn dial_failed(&self, peer: NodeAddress, id: u64) {
        self.forget_outbound(&peer, id);
        if self.link_counts.lock().contains_key(&peer) {
            debug!(peer = %peer, "Dial failed but an inbound link is up, staying associated");
            return;
        }
        let _ = self.events.send(TransportEvent::Disassociated(peer));
    }

    fn forget_outbound(&self, peer: &NodeAddress, id: u64) {
        let mut outbound = self.outbound.lock();
        if outbound.get(peer).map(|o| o.id) == Some(id) {
            outbound.remove(peer);
        }
    }
}

/// Cluster transport over plain TCP. Cheap to clone.
#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<TcpInner>,
}

impl TcpTransport {
    /// Listen on `bind_addr` and start accepting peers. `local` is the address
    /// other nodes use to reach this one.
    pub async fn bind(
        local: NodeAddress,
        bind_addr: SocketAddr,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            ClusterError::Transport(format!("Failed to bind {}: {}", bind_addr, e))
        })?;
        info!("Cluster transport listening on {} as {}", bind_addr, local);

        let (events, receiver) = mpsc::unbounded_channel();
        let transport = Self {
            inner: Arc::new(TcpInner {
                local,
                events,
                outbound: Mutex::new(HashMap::new()),
                link_counts: Mutex::new(HashMap::new()),
                next_link_id: Mutex::new(0),
                cancel: CancellationToken::new(),
            }),
        };

        tokio::spawn(Self::accept_loop(Arc::clone(&transport.inner), listener));
        Ok((transport, receiver))
    }

    /// Close every link and stop accepting
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    async fn accept_loop(inner: Arc<TcpInner>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = inner.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let _ = stream.set_nodelay(true);
                        tokio::spawn(Self::serve_inbound(Arc::clone(&inner), stream, remote));
                    }
                    Err(e) => warn!("Failed to accept cluster connection: {}", e),
                }
            }
        }
        debug!("Cluster transport accept loop stopped");
    }

    async fn serve_inbound(inner: Arc<TcpInner>, stream: TcpStream, remote: SocketAddr) {
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

        let peer = match framed.next().await {
            Some(Ok(bytes)) => match decode(&bytes) {
                Ok(Frame::Hello { from }) => from,
                Ok(_) => {
                    warn!(remote = %remote, "Expected hello as first frame");
                    return;
                }
                Err(e) => {
                    warn!(remote = %remote, "Failed to decode hello: {}", e);
                    return;
                }
            },
            _ => return,
        };

        inner.link_up(&peer);
        Self::read_frames(&inner, &peer, framed.map(|r| r.map(|b| b.freeze()))).await;
        inner.link_down(&peer);
    }

    async fn read_frames<S>(inner: &TcpInner, peer: &NodeAddress, mut frames: S)
    where
        S: futures::Stream<Item = std::io::Result<Bytes>> + Unpin,
    {
        loop {
            let next = tokio::select! {
                _ = inner.cancel.cancelled() => break,
                next = frames.next() => next,
            };
            match next {
                Some(Ok(bytes)) => match decode(&bytes) {
                    Ok(Frame::Message(message)) => {
                        let _ = inner.events.send(TransportEvent::Message {
                            from: peer.clone(),
                            message,
                        });
                    }
                    Ok(Frame::Hello { .. }) => {
                        debug!(peer = %peer, "Ignoring repeated hello");
                    }
                    Err(e) => {
                        warn!(peer = %peer, "Dropping link after undecodable frame: {}", e);
                        break;
                    }
                },
                Some(Err(e)) => {
                    debug!(peer = %peer, "Link read failed: {}", e);
                    break;
                }
                None => break,
            }
        }
    }

    async fn run_outbound(
        inner: Arc<TcpInner>,
        peer: NodeAddress,
        id: u64,
        mut queue: mpsc::UnboundedReceiver<PeerMessage>,
    ) {
        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(peer.to_string()))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!(peer = %peer, "Failed to connect: {}", e);
                inner.dial_failed(peer, id);
                return;
            }
            Err(_) => {
                debug!(peer = %peer, "Connect timed out");
                inner.dial_failed(peer, id);
                return;
            }
        };
        let _ = stream.set_nodelay(true);

        let (mut sink, stream) = Framed::new(stream, LengthDelimitedCodec::new()).split();
        let hello = match encode(&Frame::Hello {
            from: inner.local.clone(),
        }) {
            Ok(hello) => hello,
            Err(e) => {
                warn!("Failed to encode hello: {}", e);
                inner.forget_outbound(&peer, id);
                return;
            }
        };
        if let Err(e) = sink.send(hello).await {
            debug!(peer = %peer, "Failed to send hello: {}", e);
            inner.dial_failed(peer, id);
            return;
        }

        inner.link_up(&peer);

        let reader_inner = Arc::clone(&inner);
        let reader_peer = peer.clone();
        let mut reader = tokio::spawn(async move {
            Self::read_frames(
                &reader_inner,
                &reader_peer,
                stream.map(|r| r.map(|b| b.freeze())),
            )
            .await;
        });

        loop {
            tokio::select! {
                _ = inner.cancel.cancelled() => break,
                _ = &mut reader => break,
                message = queue.recv() => {
                    let Some(message) = message else { break };
                    let kind = message.kind();
                    let frame = match encode(&Frame::Message(message)) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(peer = %peer, kind, "Failed to encode message: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(frame).await {
                        debug!(peer = %peer, "Link write failed: {}", e);
                        break;
                    }
                }
            }
        }

        reader.abort();
        inner.forget_outbound(&peer, id);
        inner.link_down(&peer);
    }
}

impl Transport for TcpTransport {
    fn local_address(&self) -> &NodeAddress {
        &self.inner.local
    }

    fn send(&self, to: &NodeAddress, message: PeerMessage) {
        if self.inner.cancel.is_cancelled() {
            return;
        }

        let mut outbound = self.inner.outbound.lock();
        let message = match outbound.get(to) {
            Some(existing) => match existing.queue.send(message) {
                Ok(()) => return,
                Err(mpsc::error::SendError(message)) => message,
            },
            None => message,
        };

        let id = {
            let mut next = self.inner.next_link_id.lock();
            *next += 1;
            *next
        };
        let (queue, receiver) = mpsc::unbounded_channel();
        let _ = queue.send(message);
        outbound.insert(to.clone(), Outbound { id, queue });
        drop(outbound);

        tokio::spawn(Self::run_outbound(
            Arc::clone(&self.inner),
            to.clone(),
            id,
            receiver,
        ));
    }
}
