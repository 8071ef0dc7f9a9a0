//! Events the chain engine publishes to observers as it processes blocks.
//!
//! Delivered over a [`tokio::sync::broadcast`] channel rather than a direct
//! callback so an arbitrary number of observers (RPC, logging, metrics) can
//! subscribe independently and a slow subscriber only risks lagging its own
//! receiver, not blocking block processing.

use bitcoin::block::Block;
use bitcoin::BlockHash;

use crate::coinview::CoinView;
use crate::entry::ChainEntry;
use crate::error::VerifyError;

/// Capacity of the broadcast channel; a subscriber that falls more than this
/// many events behind receives `RecvError::Lagged` rather than blocking the
/// chain.
pub const CHANNEL_CAPACITY: usize = 512;

/// One observable state transition of the chain engine.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    /// The canonical chain tip changed to this entry.
    Tip(ChainEntry),
    /// A block was accepted as a valid header (not necessarily connected to
    /// the main chain).
    Block(Block, ChainEntry),
    /// `entry`/`block` connected to the main chain, producing `view`.
    Connect { entry: ChainEntry, block: Block, view: std::sync::Arc<CoinView> },
    /// `entry`/`block` was disconnected from the main chain during a
    /// reorganization.
    Disconnect { entry: ChainEntry, block: Block, view: std::sync::Arc<CoinView> },
    /// `entry`/`block`, previously disconnected, was reconnected.
    Reconnect { entry: ChainEntry, block: Block },
    /// The main chain changed from `old_tip` to `new_tip` via a
    /// reorganization.
    Reorganize { old_tip: BlockHash, new_tip: BlockHash },
    /// A valid block arrived that extends a chain with less work than the
    /// current best, i.e. a losing competitor in an ongoing fork race.
    Competitor(Block, ChainEntry),
    /// A block whose parent is unknown was stored pending that parent.
    Orphan(Block),
    /// An orphan was rejected outright (malformed, or its announcing peer
    /// should be penalized).
    BadOrphan { error: VerifyError, peer_id: u64 },
    /// `hash` matched (or conflicted with) a configured checkpoint at
    /// `height`.
    Checkpoint { hash: BlockHash, height: u32 },
    /// The orphan pool is at capacity and rejected a new arrival outright.
    Full,
    /// The chain was reset back to `tip` (e.g. after a checkpoint mismatch).
    Reset(ChainEntry),
}

/// Sending half of the chain's event channel, held by [`crate::chain::Chain`].
pub type EventSender = tokio::sync::broadcast::Sender<ChainEvent>;

/// Receiving half, handed out to observers via [`crate::chain::Chain::subscribe`].
pub type EventReceiver = tokio::sync::broadcast::Receiver<ChainEvent>;

/// Build a fresh event channel pair.
pub fn channel() -> (EventSender, EventReceiver) {
    tokio::sync::broadcast::channel(CHANNEL_CAPACITY)
}
