//! Fire-and-forget notifications for relay and subscribers.
//!
//! Events raised inside an atomic unit are held until the outermost unit
//! commits, so a rolled-back attempt never announces anything.

use crossbeam_channel::{unbounded, Receiver, Sender};
use utxod_consensus::Hash256;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainEvent {
    BlockConnected { hash: Hash256, height: u32 },
    BlockDisconnected { hash: Hash256, height: u32 },
    RelayBlock(Hash256),
    RelayTx(Hash256),
    PoolAdded(Hash256),
    PoolConflicted(Hash256),
}

#[derive(Default)]
pub struct EventBuffer {
    sender: Option<Sender<ChainEvent>>,
    pending: Vec<ChainEvent>,
    marks: Vec<usize>,
}

impl EventBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any previous subscriber.
    pub fn subscribe(&mut self) -> Receiver<ChainEvent> {
        let (sender, receiver) = unbounded();
        self.sender = Some(sender);
        receiver
    }

    pub fn begin(&mut self) {
        self.marks.push(self.pending.len());
    }

    pub fn push(&mut self, event: ChainEvent) {
        if self.marks.is_empty() {
            self.publish(event);
        } else {
            self.pending.push(event);
        }
    }

    pub fn commit(&mut self) {
        self.marks.pop();
        if self.marks.is_empty() {
            for event in std::mem::take(&mut self.pending) {
                self.publish(event);
            }
        }
    }

    pub fn rollback(&mut self) {
        if let Some(mark) = self.marks.pop() {
            self.pending.truncate(mark);
        }
    }

    fn publish(&mut self, event: ChainEvent) {
        let Some(sender) = &self.sender else {
            return;
        };
        if sender.send(event).is_err() {
            self.sender = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_rollback_drops_only_inner_events() {
        let mut events = EventBuffer::new();
        let receiver = events.subscribe();
        events.begin();
        events.push(ChainEvent::RelayTx([1u8; 32]));
        events.begin();
        events.push(ChainEvent::RelayTx([2u8; 32]));
        events.rollback();
        assert!(receiver.try_recv().is_err());
        events.commit();

        assert_eq!(receiver.try_recv(), Ok(ChainEvent::RelayTx([1u8; 32])));
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn dropped_receiver_is_ignored() {
        let mut events = EventBuffer::new();
        drop(events.subscribe());
        events.push(ChainEvent::PoolAdded([3u8; 32]));
        events.push(ChainEvent::PoolAdded([4u8; 32]));
    }
}
