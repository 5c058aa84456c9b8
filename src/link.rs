// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Point-to-point bidirectional message links between the coordinator and
//! each spawned actor. A [Link] is one end of a pair of unbounded mpsc
//! channels, one per direction, so delivery is reliable and FIFO per
//! direction. Receives are poll-based: [Link::try_recv] never blocks, and a
//! peer that has terminated (dropping its end) surfaces as
//! [TryRecvError::Disconnected] once the buffered backlog is drained.

use crate::{Error, ProtocolMessage};
use async_std::future;
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use std::time::Duration;

/// Result of a failed [Link::try_recv].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TryRecvError {
    /// Nothing buffered right now; the peer end is still open.
    Empty,
    /// The peer end has been dropped and the backlog is fully drained.
    Disconnected,
}

/// One endpoint of a bidirectional link. The other endpoint is returned by
/// the same [link] call; each side owns its endpoint exclusively.
pub struct Link {
    tx: UnboundedSender<ProtocolMessage>,
    rx: UnboundedReceiver<ProtocolMessage>,
}

/// Create a connected pair of endpoints. Messages sent on one endpoint are
/// received, in order, on the other.
pub fn link() -> (Link, Link) {
    let (a_tx, b_rx) = mpsc::unbounded();
    let (b_tx, a_rx) = mpsc::unbounded();
    (Link { tx: a_tx, rx: a_rx }, Link { tx: b_tx, rx: b_rx })
}

impl Link {
    /// Enqueue a message for the peer. Fails only if the peer endpoint has
    /// been dropped, which callers treat as an implicit exit of that peer.
    pub fn send(&self, msg: ProtocolMessage) -> Result<(), Error> {
        self.tx.unbounded_send(msg).map_err(|_| Error::ChannelClosed)
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Result<ProtocolMessage, TryRecvError> {
        match self.rx.try_next() {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(TryRecvError::Disconnected),
            Err(_) => Err(TryRecvError::Empty),
        }
    }
}

/// Bounded idle sleep between polling ticks. Caps CPU usage in the receive
/// loops without introducing an unbounded suspension point.
pub(crate) async fn idle_wait(delay: Duration) {
    let never = future::pending::<()>();
    let _ = future::timeout(delay, never).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ActorId, TxId};

    #[test]
    fn fifo_per_direction() {
        let (a, mut b) = link();
        for n in 0..4 {
            a.send(ProtocolMessage::VoteRequest { txid: TxId(n) }).unwrap();
        }
        for n in 0..4 {
            assert_eq!(
                b.try_recv().unwrap(),
                ProtocolMessage::VoteRequest { txid: TxId(n) }
            );
        }
        assert_eq!(b.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn both_directions_independent() {
        let (mut a, mut b) = link();
        a.send(ProtocolMessage::Exit).unwrap();
        b.send(ProtocolMessage::Request {
            client: ActorId::Client(0),
        })
        .unwrap();
        assert_eq!(b.try_recv().unwrap(), ProtocolMessage::Exit);
        assert_eq!(
            a.try_recv().unwrap(),
            ProtocolMessage::Request {
                client: ActorId::Client(0)
            }
        );
    }

    #[test]
    fn disconnect_observed_after_backlog_drained() {
        let (a, mut b) = link();
        a.send(ProtocolMessage::Exit).unwrap();
        drop(a);
        // The buffered message is still delivered before the hangup shows.
        assert_eq!(b.try_recv().unwrap(), ProtocolMessage::Exit);
        assert_eq!(b.try_recv(), Err(TryRecvError::Disconnected));
        assert!(b.send(ProtocolMessage::Exit).is_err());
    }
}
