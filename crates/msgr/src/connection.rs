//! Connection and messenger seams.
//!
//! A [`Connection`] queues outgoing messages without blocking; delivery is
//! the transport's problem. The [`Messenger`] opens connections and carries
//! the lightweight ping used to probe a possibly-dead peer.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{MsgrError, Result};
use crate::message::Message;
use crate::types::{EntityAddr, EntityName};

/// Shared handle to an open connection.
pub type ConnectionRef = Arc<dyn Connection>;

/// A reliable, ordered, connection-oriented channel to one peer.
pub trait Connection: Send + Sync {
    /// Queue a message for delivery. Non-blocking: a full or closed queue is
    /// reported as an error and the message is dropped.
    fn send(&self, msg: Arc<Message>) -> Result<()>;

    fn peer_name(&self) -> EntityName;

    fn peer_addr(&self) -> EntityAddr;
}

/// Connection factory plus out-of-band probing.
pub trait Messenger: Send + Sync {
    fn connect(&self, name: EntityName, addr: EntityAddr) -> ConnectionRef;

    /// Fire a ping at a peer to force detection of a dead channel.
    fn ping(&self, name: EntityName, addr: EntityAddr);
}

/// Connection backed by a bounded in-process queue. A transport (or a test
/// harness) owns the receiving end and drains it in its own task.
pub struct ChannelConnection {
    name: EntityName,
    addr: EntityAddr,
    tx: mpsc::Sender<Arc<Message>>,
}

/// Create a connection and the queue a transport drains for it.
pub fn channel_connection(
    name: EntityName,
    addr: EntityAddr,
    capacity: usize,
) -> (Arc<ChannelConnection>, mpsc::Receiver<Arc<Message>>) {
    let (tx, rx) = mpsc::channel(capacity);
    (Arc::new(ChannelConnection { name, addr, tx }), rx)
}

impl Connection for ChannelConnection {
    fn send(&self, msg: Arc<Message>) -> Result<()> {
        debug!("{} queueing {}", self.name, msg);
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => MsgrError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => MsgrError::ConnectionClosed,
        })
    }

    fn peer_name(&self) -> EntityName {
        self.name
    }

    fn peer_addr(&self) -> EntityAddr {
        self.addr
    }
}
