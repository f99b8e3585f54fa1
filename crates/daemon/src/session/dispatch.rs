//! Typed dispatch table for inbound packets.
//!
//! Waiters register under a `(message, token)` key: one-shot waiters
//! resolve exactly once and are removed; stream subscribers observe every
//! delivery. A packet dispatched with a token also fires the token-less
//! key, so a flow can watch a message kind without knowing tokens.
//!
//! String-keyed handler maps stay out of this layer entirely; wire names
//! only exist inside the catalog.

use std::collections::HashMap;

use protocol::{MessageName, Packet};
use tokio::sync::{mpsc, oneshot};

/// Dispatch key: message kind plus optional correlation token.
pub type EventKey = (MessageName, Option<u8>);

/// Packet fan-out for one session.
#[derive(Debug, Default)]
pub struct Dispatch {
    once: HashMap<EventKey, Vec<oneshot::Sender<Packet>>>,
    streams: HashMap<EventKey, Vec<mpsc::UnboundedSender<Packet>>>,
}

impl Dispatch {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter resolved by the next matching packet.
    ///
    /// Dropping the table (or `fail_all`) drops the sender, so the
    /// receiver errors instead of hanging.
    pub fn once(&mut self, name: MessageName, token: Option<u8>) -> oneshot::Receiver<Packet> {
        let (tx, rx) = oneshot::channel();
        self.once.entry((name, token)).or_default().push(tx);
        rx
    }

    /// Registers a stream observing every matching packet.
    pub fn subscribe(
        &mut self,
        name: MessageName,
        token: Option<u8>,
    ) -> mpsc::UnboundedReceiver<Packet> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.entry((name, token)).or_default().push(tx);
        rx
    }

    /// Cancels every waiter and subscriber under a key.
    pub fn cancel(&mut self, name: MessageName, token: Option<u8>) {
        self.once.remove(&(name, token));
        self.streams.remove(&(name, token));
    }

    /// Delivers a packet. Returns true when at least one waiter or
    /// subscriber observed it.
    pub fn dispatch(&mut self, name: MessageName, token: Option<u8>, packet: &Packet) -> bool {
        let mut delivered = self.fire((name, token), packet);
        if token.is_some() {
            // Token-agnostic observers see tokened traffic too.
            delivered |= self.fire((name, None), packet);
        }
        delivered
    }

    fn fire(&mut self, key: EventKey, packet: &Packet) -> bool {
        let mut delivered = false;

        if let Some(waiters) = self.once.remove(&key) {
            for waiter in waiters {
                delivered |= waiter.send(packet.clone()).is_ok();
            }
        }

        if let Some(streams) = self.streams.get_mut(&key) {
            streams.retain(|tx| tx.send(packet.clone()).is_ok());
            delivered |= !streams.is_empty();
            if streams.is_empty() {
                self.streams.remove(&key);
            }
        }

        delivered
    }

    /// Drops every registration; outstanding waits observe the closure.
    pub fn fail_all(&mut self) {
        self.once.clear();
        self.streams.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::MessageName;

    fn packet(message_id: u16) -> Packet {
        Packet::ping(message_id)
    }

    #[test]
    fn test_once_resolves_and_is_removed() {
        let mut dispatch = Dispatch::new();
        let rx = dispatch.once(MessageName::FunctionReturn, Some(3));

        let delivered = dispatch.dispatch(MessageName::FunctionReturn, Some(3), &packet(1));
        assert!(delivered);
        assert_eq!(rx.blocking_recv().unwrap().message_id, 1);

        // A second delivery finds no waiter.
        let delivered = dispatch.dispatch(MessageName::FunctionReturn, Some(3), &packet(2));
        assert!(!delivered);
    }

    #[test]
    fn test_token_mismatch_not_delivered() {
        let mut dispatch = Dispatch::new();
        let rx = dispatch.once(MessageName::FunctionReturn, Some(3));

        let delivered = dispatch.dispatch(MessageName::FunctionReturn, Some(4), &packet(1));
        assert!(!delivered);
        drop(dispatch);
        assert!(rx.blocking_recv().is_err());
    }

    #[test]
    fn test_tokened_dispatch_reaches_generic_subscriber() {
        let mut dispatch = Dispatch::new();
        let mut rx = dispatch.subscribe(MessageName::DescribeReturn, None);

        dispatch.dispatch(MessageName::DescribeReturn, Some(9), &packet(5));
        assert_eq!(rx.blocking_recv().unwrap().message_id, 5);
    }

    #[test]
    fn test_subscribe_sees_every_delivery() {
        let mut dispatch = Dispatch::new();
        let mut rx = dispatch.subscribe(MessageName::ChunkMissed, None);

        dispatch.dispatch(MessageName::ChunkMissed, None, &packet(1));
        dispatch.dispatch(MessageName::ChunkMissed, None, &packet(2));

        assert_eq!(rx.blocking_recv().unwrap().message_id, 1);
        assert_eq!(rx.blocking_recv().unwrap().message_id, 2);
    }

    #[test]
    fn test_multiple_once_waiters_each_resolve() {
        let mut dispatch = Dispatch::new();
        let rx1 = dispatch.once(MessageName::UpdateReady, None);
        let rx2 = dispatch.once(MessageName::UpdateReady, None);

        dispatch.dispatch(MessageName::UpdateReady, None, &packet(7));

        assert_eq!(rx1.blocking_recv().unwrap().message_id, 7);
        assert_eq!(rx2.blocking_recv().unwrap().message_id, 7);
    }

    #[test]
    fn test_cancel_drops_waiters() {
        let mut dispatch = Dispatch::new();
        let rx = dispatch.once(MessageName::UpdateReady, Some(1));
        dispatch.cancel(MessageName::UpdateReady, Some(1));

        assert!(rx.blocking_recv().is_err());
        assert!(!dispatch.dispatch(MessageName::UpdateReady, Some(1), &packet(1)));
    }

    #[test]
    fn test_fail_all_rejects_outstanding_waits() {
        let mut dispatch = Dispatch::new();
        let rx = dispatch.once(MessageName::VariableValue, Some(2));
        let mut stream = dispatch.subscribe(MessageName::ChunkMissed, None);

        dispatch.fail_all();

        assert!(rx.blocking_recv().is_err());
        assert!(stream.blocking_recv().is_none());
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let mut dispatch = Dispatch::new();
        let rx = dispatch.subscribe(MessageName::ChunkMissed, None);
        drop(rx);

        let delivered = dispatch.dispatch(MessageName::ChunkMissed, None, &packet(1));
        assert!(!delivered);
    }
}
