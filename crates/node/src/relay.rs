//! Drains engine events on a background thread.

use std::thread::{self, JoinHandle};

use crossbeam_channel::Receiver;
use log::{debug, info};
use utxod_chainstate::ChainEvent;
use utxod_consensus::hash256_to_hex;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RelayCounts {
    pub connected: u64,
    pub disconnected: u64,
    pub relayed_blocks: u64,
    pub relayed_txs: u64,
    pub pool_added: u64,
    pub pool_conflicted: u64,
}

impl RelayCounts {
    fn record(&mut self, event: &ChainEvent) {
        match event {
            ChainEvent::BlockConnected { hash, height } => {
                self.connected += 1;
                debug!("connected {} at {height}", hash256_to_hex(hash));
            }
            ChainEvent::BlockDisconnected { hash, height } => {
                self.disconnected += 1;
                info!("disconnected {} from {height}", hash256_to_hex(hash));
            }
            ChainEvent::RelayBlock(hash) => {
                self.relayed_blocks += 1;
                debug!("relay block {}", hash256_to_hex(hash));
            }
            ChainEvent::RelayTx(txid) => {
                self.relayed_txs += 1;
                debug!("relay tx {}", hash256_to_hex(txid));
            }
            ChainEvent::PoolAdded(txid) => {
                self.pool_added += 1;
                debug!("pool added {}", hash256_to_hex(txid));
            }
            ChainEvent::PoolConflicted(txid) => {
                self.pool_conflicted += 1;
                info!("pool conflicted {}", hash256_to_hex(txid));
            }
        }
    }
}

/// Runs until every sender is dropped, then returns what it saw.
pub fn spawn(events: Receiver<ChainEvent>) -> JoinHandle<RelayCounts> {
    thread::spawn(move || {
        let mut counts = RelayCounts::default();
        for event in events.iter() {
            counts.record(&event);
        }
        counts
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn counts_until_the_engine_hangs_up() {
        let (sender, receiver) = unbounded();
        let handle = spawn(receiver);
        let hash = [3u8; 32];
        sender
            .send(ChainEvent::BlockConnected { hash, height: 1 })
            .expect("send");
        sender.send(ChainEvent::RelayBlock(hash)).expect("send");
        sender.send(ChainEvent::PoolAdded([4u8; 32])).expect("send");
        sender.send(ChainEvent::RelayTx([4u8; 32])).expect("send");
        sender
            .send(ChainEvent::PoolConflicted([4u8; 32]))
            .expect("send");
        drop(sender);

        let counts = handle.join().expect("relay thread");
        assert_eq!(
            counts,
            RelayCounts {
                connected: 1,
                disconnected: 0,
                relayed_blocks: 1,
                relayed_txs: 1,
                pool_added: 1,
                pool_conflicted: 1,
            }
        );
    }
}
