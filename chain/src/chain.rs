//! The chain engine: block acceptance, contextual verification,
//! reorganization, and the administrative operations built on top of a
//! [`ChainDb`].
//!
//! Mirrors the signer's event-loop lineage in shape -- a long-lived struct
//! wrapping collaborators, `tracing::instrument`ed entry points, errors
//! logged at the boundary and propagated past it -- but there is no event
//! loop here: `Chain` is called directly by an embedding application (a P2P
//! message handler, a test harness) rather than owning a `run()` loop
//! itself, since block arrival is driven by the caller, not by a signal
//! stream this crate owns.

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use bitcoin::block::Block;
use bitcoin::hashes::Hash as _;
use bitcoin::{BlockHash, Transaction, TxIn};
use script::VerifyFlags;
use tokio::sync::Mutex;

use crate::coinview::{Coin, CoinView};
use crate::config::NetworkParams;
use crate::db::{ChainDb, DbError};
use crate::deployment::{compute_state, get_deployments, Deployment, DeploymentState, VersionBitsCache, VersionBitsState};
use crate::difficulty::{asert_retarget, daa_retarget, emergency_difficulty_adjustment, legacy_retarget, suitable_block};
use crate::entry::ChainEntry;
use crate::error::{Error, VerifyError};
use crate::events::{channel, ChainEvent, EventReceiver, EventSender};
use crate::orphan::{Orphan, OrphanPool};
use crate::worker::{ScriptJob, TransactionContext, WorkerPool};

/// Number of preceding blocks (inclusive of the block itself) whose
/// timestamps are sorted to find the median-time-past.
const MEDIAN_TIME_SPAN: u32 = 11;
/// A block's timestamp may not be more than two hours ahead of the local
/// clock.
const MAX_FUTURE_BLOCK_TIME: u32 = 2 * 60 * 60;
/// Minimum serialized size (bytes) for a non-coinbase transaction once
/// Magnetic Anomaly is active.
const MIN_TRANSACTION_SIZE: usize = 100;
/// Legacy 2016-block retarget window.
const LEGACY_RETARGET_INTERVAL: u32 = 2016;
/// DAA suitable-block window: the anchor ends 144 blocks before the tip.
const DAA_WINDOW: u32 = 144;
/// Locktime values below this are interpreted as a block height; at or above
/// it, a Unix timestamp (the reference `LOCKTIME_THRESHOLD`).
const LOCKTIME_THRESHOLD: u32 = 500_000_000;
/// Maximum sigchecks a single transaction's inputs may accumulate.
const MAX_TX_SIGCHECKS: u32 = 3_000;
/// Pre-Phonon legacy sigop-style cap on a block's total sigchecks, scaled by
/// serialized block size the way the original per-megabyte sigop limit was.
/// Retired once Phonon activates, since `INPUT_SIGCHECKS` ties per-input
/// cost to scriptSig size directly instead.
const MAX_BLOCK_SIGCHECKS_PER_MB: u64 = 20_000;

/// The chain engine. Generic over [`ChainDb`] so callers can supply an
/// in-memory store ([`crate::db::MemoryChainDb`]) for tests or a durable
/// backend of their own for production use.
pub struct Chain<D: ChainDb> {
    db: D,
    params: NetworkParams,
    events: EventSender,
    workers: WorkerPool,
    orphans: Mutex<OrphanPool>,
    invalid: Mutex<lru::LruCache<BlockHash, ()>>,
    versionbits: Mutex<VersionBitsCache>,
    /// Chain-wide mutex serializing `add`/`reset`/`invalidate`/`replay`/
    /// `prune`/`scan`; read-only lookups go straight to `db` without taking
    /// it.
    mutate: Mutex<()>,
}

impl<D: ChainDb> Chain<D> {
    /// Open a chain engine over an already-seeded `db` (it must already
    /// contain at least a genesis entry). Returns the engine plus a
    /// subscription to its event stream; further subscribers can be added
    /// later via [`Chain::subscribe`].
    pub fn open(db: D, params: NetworkParams, worker_concurrency: usize) -> (Self, EventReceiver) {
        let (events, receiver) = channel();
        let invalid_capacity = NonZeroUsize::new(params.deployments.invalid_set_capacity).unwrap_or(NonZeroUsize::MIN);
        let chain = Chain {
            orphans: Mutex::new(OrphanPool::new(params.deployments.max_orphans)),
            invalid: Mutex::new(lru::LruCache::new(invalid_capacity)),
            workers: WorkerPool::new(worker_concurrency),
            versionbits: Mutex::new(VersionBitsCache::new()),
            mutate: Mutex::new(()),
            db,
            params,
            events,
        };
        (chain, receiver)
    }

    /// Subscribe an additional observer to chain events.
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// The network parameters this chain was opened with.
    pub fn params(&self) -> &NetworkParams {
        &self.params
    }

    /// The current best entry.
    pub async fn tip(&self) -> Result<ChainEntry, Error> {
        self.db.get_tip().await?.ok_or_else(|| Error::Db(DbError::NotFound("chain has no tip".to_string())))
    }

    /// Look up an entry by hash, main chain or side branch.
    pub async fn get_entry(&self, hash: BlockHash) -> Result<Option<ChainEntry>, Error> {
        Ok(self.db.get_entry(hash).await?)
    }

    /// Look up the main-chain entry at `height`.
    pub async fn get_entry_by_height(&self, height: u32) -> Result<Option<ChainEntry>, Error> {
        Ok(self.db.get_entry_by_height(height).await?)
    }

    /// Fetch a full block by hash.
    pub async fn get_block(&self, hash: BlockHash) -> Result<Option<Block>, Error> {
        Ok(self.db.get_block(hash).await?)
    }

    /// A chain locator built from the main chain ending at `tip`, for
    /// describing this chain's state to a peer.
    pub async fn locator(&self, tip: &ChainEntry) -> Result<Vec<BlockHash>, Error> {
        let mut entries = Vec::with_capacity((tip.height + 1) as usize);
        let mut current = tip.clone();
        loop {
            entries.push(current.clone());
            if current.height == 0 {
                break;
            }
            current = self.ancestor(&current, current.height - 1).await?;
        }
        entries.reverse();
        Ok(crate::entry::build_locator(&entries))
    }

    /// Accept `block`, announced by `peer_id` under `flags`. Returns the
    /// newly-connected entry for the submitted block, or `None` if it was
    /// stored as an orphan pending its parent's arrival.
    ///
    /// `flags` governs two things here: whether proof-of-work is actually
    /// checked (`VERIFY_POW`, skippable for a trusted checkpoint-relative
    /// fast-sync path) and whether full transaction-level verification runs
    /// at all (`VERIFY_BODY`, skippable for headers-first sync). The
    /// consensus script-interpreter flags used to verify a block's inputs
    /// are always the ones [`crate::deployment::get_deployments`] derives
    /// for that block's height/MTP, never a caller override.
    #[tracing::instrument(skip(self, block), fields(hash = %block.block_hash(), peer_id))]
    pub async fn add(&self, block: Block, flags: VerifyFlags, peer_id: u64) -> Result<Option<ChainEntry>, Error> {
        let _guard = self.mutate.lock().await;
        let hash = block.block_hash();

        if self.db.has_entry(hash).await? {
            return Err(VerifyError::duplicate("duplicate-block").into());
        }
        if self.invalid.lock().await.contains(&hash) {
            return Err(VerifyError::invalid("duplicate-invalid-block", 0).into());
        }
        if self.orphans.lock().await.contains(&hash) {
            return Err(VerifyError::duplicate("duplicate-orphan").into());
        }

        let mut queue = VecDeque::new();
        queue.push_back((block, flags, peer_id));
        let mut result = None;
        let mut first = true;

        while let Some((block, flags, peer_id)) = queue.pop_front() {
            let block_hash = block.block_hash();

            if flags.intersects(VerifyFlags::VERIFY_POW) && !self.check_proof_of_work(&block) {
                let error = VerifyError::invalid("high-hash", 50);
                if first {
                    return Err(error.into());
                }
                self.invalid.lock().await.put(block_hash, ());
                let _ = self.events.send(ChainEvent::BadOrphan { error, peer_id });
                first = false;
                continue;
            }

            let prev = match self.db.get_entry(block.header.prev_blockhash).await? {
                Some(prev) => prev,
                None => {
                    if !first {
                        // A dequeued orphan's parent is always the entry we
                        // just connected; this branch cannot be reached.
                        continue;
                    }
                    let orphan = Orphan { block: block.clone(), flags, peer_id, received_at: Instant::now() };
                    self.orphans.lock().await.insert(block_hash, orphan);
                    let _ = self.events.send(ChainEvent::Orphan(block));
                    return Ok(None);
                }
            };

            match self.connect(&prev, block.clone(), flags).await {
                Ok(entry) => {
                    let _ = self.events.send(ChainEvent::Block(block, entry.clone()));
                    if first {
                        result = Some(entry.clone());
                    }
                    if let Some(waiting) = self.orphans.lock().await.take_waiting_on(&entry.hash) {
                        queue.push_back((waiting.block, waiting.flags, waiting.peer_id));
                    }
                }
                Err(Error::Verify(error)) => {
                    if !error.malleated {
                        self.invalid.lock().await.put(block_hash, ());
                        let _ = self.events.send(ChainEvent::BadOrphan { error: error.clone(), peer_id });
                    }
                    if first {
                        return Err(Error::Verify(error));
                    }
                }
                Err(other) => {
                    if first {
                        return Err(other);
                    }
                    tracing::error!(error = %other, %block_hash, "orphan reconnection failed");
                }
            }
            first = false;
        }

        Ok(result)
    }

    /// Roll the chain back to `hash`, discarding every descendant. Purges
    /// the orphan pool, since orphans accumulated on top of the discarded
    /// history can never connect.
    #[tracing::instrument(skip(self))]
    pub async fn reset(&self, hash: BlockHash) -> Result<ChainEntry, Error> {
        let _guard = self.mutate.lock().await;
        let entry = self.db.reset(hash).await?;
        self.orphans.lock().await.clear();
        let _ = self.events.send(ChainEvent::Reset(entry.clone()));
        Ok(entry)
    }

    /// As [`Chain::reset`], but naming the rollback point by height on the
    /// current main chain.
    pub async fn reset_to_height(&self, height: u32) -> Result<ChainEntry, Error> {
        let target = self
            .db
            .get_entry_by_height(height)
            .await?
            .ok_or_else(|| Error::Db(DbError::NotFound(format!("no main-chain entry at height {height}"))))?;
        self.reset(target.hash).await
    }

    /// Mark `hash` invalid. If it names an entry on the current main chain,
    /// rolls the chain back to its parent first.
    #[tracing::instrument(skip(self))]
    pub async fn invalidate(&self, hash: BlockHash) -> Result<(), Error> {
        let _guard = self.mutate.lock().await;
        self.invalid.lock().await.put(hash, ());

        let Some(entry) = self.db.get_entry(hash).await? else { return Ok(()) };
        let tip = self.tip().await?;
        if !self.is_ancestor(&entry, &tip).await? {
            return Ok(());
        }
        let prev = self
            .db
            .get_previous(&entry)
            .await?
            .ok_or_else(|| Error::Db(DbError::Inconsistent("invalidated entry has no parent")))?;
        self.db.reset(prev.hash).await?;
        self.orphans.lock().await.clear();
        let _ = self.events.send(ChainEvent::Reset(prev));
        Ok(())
    }

    /// Re-run header and (if the block is available) full contextual
    /// verification for every main-chain entry in `from_height..=tip`,
    /// without altering chain state unless a failure is found. Used after a
    /// parameter change to confirm already-connected history is still
    /// considered valid.
    #[tracing::instrument(skip(self))]
    pub async fn replay(&self, from_height: u32) -> Result<(), Error> {
        let _guard = self.mutate.lock().await;
        let tip = self.tip().await?;
        let mut height = from_height;
        while height <= tip.height {
            let Some(entry) = self.db.get_entry_by_height(height).await? else {
                height += 1;
                continue;
            };
            let Some(prev) = self.db.get_previous(&entry).await? else {
                height += 1;
                continue;
            };
            if let Some(block) = self.db.get_block(entry.hash).await? {
                self.verify_context(&entry, &block, &prev, VerifyFlags::VERIFY_BODY).await?;
            } else {
                self.verify(&entry, &prev, self.median_time_past(&prev).await?).await?;
            }
            height += 1;
        }
        Ok(())
    }

    /// Re-run header-only verification for every main-chain entry in
    /// `from_height..=to_height`, reporting the first failure without
    /// touching chain state. A lighter-weight audit than [`Chain::replay`]:
    /// it never re-verifies transaction bodies.
    #[tracing::instrument(skip(self))]
    pub async fn scan(&self, from_height: u32, to_height: u32) -> Result<(), Error> {
        let _guard = self.mutate.lock().await;
        for height in from_height..=to_height {
            let Some(entry) = self.db.get_entry_by_height(height).await? else { continue };
            let Some(prev) = self.db.get_previous(&entry).await? else { continue };
            let mtp = self.median_time_past(&prev).await?;
            self.verify(&entry, &prev, mtp).await?;
        }
        Ok(())
    }

    /// Discard stored block bodies below `keep_from_height`.
    pub async fn prune(&self, keep_from_height: u32) -> Result<(), Error> {
        let _guard = self.mutate.lock().await;
        Ok(self.db.prune(keep_from_height).await?)
    }

    fn check_proof_of_work(&self, block: &Block) -> bool {
        let target = crate::entry::compact_to_target(block.header.bits.to_consensus());
        if target.is_zero() {
            return false;
        }
        let hash_value = crate::u256::U256::from_le_bytes(block.block_hash().to_byte_array());
        !hash_value.gt(&target)
    }

    async fn ancestor(&self, entry: &ChainEntry, height: u32) -> Result<ChainEntry, Error> {
        self.db
            .get_ancestor(entry, height)
            .await?
            .ok_or_else(|| Error::Db(DbError::NotFound(format!("no ancestor at height {height}"))))
    }

    async fn is_ancestor(&self, ancestor: &ChainEntry, descendant: &ChainEntry) -> Result<bool, Error> {
        if ancestor.height > descendant.height {
            return Ok(false);
        }
        let walked = self.db.get_ancestor(descendant, ancestor.height).await?;
        Ok(walked.map(|e| e.hash) == Some(ancestor.hash))
    }

    /// Median of up to the 11 most recent timestamps ending at (and
    /// including) `entry`.
    async fn median_time_past(&self, entry: &ChainEntry) -> Result<u32, Error> {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN as usize);
        let mut current = Some(entry.clone());
        for _ in 0..MEDIAN_TIME_SPAN {
            let Some(e) = current else { break };
            times.push(e.time);
            current = self.db.get_previous(&e).await?;
        }
        times.sort_unstable();
        Ok(times[times.len() / 2])
    }

    /// Resolve CSV's versionbits state as of `prev`, walking whatever
    /// signalling windows between genesis and `prev` are not already cached
    /// in `db`'s durable state cache.
    async fn versionbits_state(&self, prev: &ChainEntry, deployment: Deployment) -> Result<VersionBitsState, Error> {
        if let Some(cached) = self.db.state_cache_get(deployment, prev).await? {
            return Ok(cached);
        }
        let window_size = self.params.deployments.miner_window.max(1);

        let mut state = VersionBitsState::Defined;
        let mut window_start = 0u32;
        loop {
            if window_start > prev.height {
                break;
            }
            let window_end = (window_start + window_size - 1).min(prev.height);
            let window_end_entry = self.ancestor(prev, window_end).await?;

            if let Some(cached) = self.db.state_cache_get(deployment, &window_end_entry).await? {
                state = cached;
            } else {
                let mtp = self.median_time_past(&window_end_entry).await?;
                let full_window = window_end - window_start + 1 == window_size;
                let mut window_entries = Vec::new();
                if full_window {
                    for height in window_start..=window_end {
                        window_entries.push(self.ancestor(prev, height).await?);
                    }
                }
                state = compute_state(&self.params.deployments, deployment, state, &window_entries, mtp);
                self.db.state_cache_set(deployment, &window_end_entry, state).await?;
            }

            if window_end >= prev.height {
                break;
            }
            window_start += window_size;
        }
        Ok(state)
    }

    async fn deployment_state_for(&self, prev: &ChainEntry, mtp: u32) -> Result<DeploymentState, Error> {
        let csv_state = self.versionbits_state(prev, Deployment::Csv).await?;
        let mut cache = self.versionbits.lock().await;
        cache.set_state(prev, Deployment::Csv, csv_state);
        Ok(get_deployments(&self.params.deployments, prev.height + 1, mtp, prev, &cache))
    }

    async fn next_work_required(
        &self,
        prev: &ChainEntry,
        entry_time: u32,
        entry_height: u32,
        deployment_state: &DeploymentState,
    ) -> Result<u32, Error> {
        let params = &self.params.deployments;

        if deployment_state.asert {
            return Ok(asert_retarget(params, entry_time, entry_height));
        }

        if deployment_state.daa {
            if prev.height < 2 * DAA_WINDOW {
                return Ok(prev.bits);
            }
            let last = suitable_block(
                &self.ancestor(prev, prev.height).await?,
                &self.ancestor(prev, prev.height - 1).await?,
                &self.ancestor(prev, prev.height - 2).await?,
            );
            let first = suitable_block(
                &self.ancestor(prev, prev.height - DAA_WINDOW).await?,
                &self.ancestor(prev, prev.height - DAA_WINDOW - 1).await?,
                &self.ancestor(prev, prev.height - DAA_WINDOW - 2).await?,
            );
            return Ok(daa_retarget(params, first, last));
        }

        if entry_height % LEGACY_RETARGET_INTERVAL == 0 {
            if entry_height < LEGACY_RETARGET_INTERVAL {
                return Ok(prev.bits);
            }
            let first = self.ancestor(prev, entry_height - LEGACY_RETARGET_INTERVAL).await?;
            return Ok(legacy_retarget(params, prev.bits, first.time, prev.time));
        }

        if entry_height >= params.uahf_height && entry_height < params.daa_height {
            if prev.height < 6 {
                return Ok(prev.bits);
            }
            let mtp_now = self.median_time_past(prev).await?;
            let six_back = self.ancestor(prev, prev.height - 6).await?;
            let mtp_six_back = self.median_time_past(&six_back).await?;
            let span = mtp_now as i64 - mtp_six_back as i64;
            return Ok(emergency_difficulty_adjustment(params, prev.bits, span));
        }

        Ok(prev.bits)
    }

    /// Header-only contextual checks: previous-hash linkage, checkpoints,
    /// proof-of-work target, timestamp ordering, and version floors. Always
    /// runs, independent of `VERIFY_BODY`.
    async fn verify(&self, entry: &ChainEntry, prev: &ChainEntry, prev_mtp: u32) -> Result<DeploymentState, Error> {
        if entry.prev_hash != prev.hash {
            return Err(VerifyError::invalid("bad-prevblk", 100).into());
        }

        if let Some(&(_, expected_hash)) = self.params.deployments.checkpoints.iter().find(|(h, _)| *h == entry.height) {
            let _ = self.events.send(ChainEvent::Checkpoint { hash: entry.hash, height: entry.height });
            if expected_hash != entry.hash {
                return Err(VerifyError::checkpoint("checkpoint mismatch").into());
            }
        }

        let deployment_state = self.deployment_state_for(prev, prev_mtp).await?;

        let expected_bits = self.next_work_required(prev, entry.time, entry.height, &deployment_state).await?;
        if entry.bits != expected_bits {
            return Err(VerifyError::invalid("bad-diffbits", 100).into());
        }

        if entry.time <= prev_mtp {
            return Err(VerifyError::invalid("time-too-old", 0).into());
        }
        let now = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as u32).unwrap_or(u32::MAX);
        if entry.time > now.saturating_add(MAX_FUTURE_BLOCK_TIME) {
            return Err(VerifyError { malleated: true, ..VerifyError::invalid("time-too-new", 0) }.into());
        }

        if deployment_state.bip34 && entry.version < 2
            || self.params.deployments.bip66_height <= entry.height && entry.version < 3
            || self.params.deployments.bip65_height <= entry.height && entry.version < 4
        {
            return Err(VerifyError::invalid("bad-version", 0).into());
        }

        Ok(deployment_state)
    }

    /// Transaction-level checks that require the full block body: coinbase
    /// placement, canonical ordering and minimum size (post Magnetic
    /// Anomaly), `tx.version` range (post Wellington), per-transaction
    /// finality, the BIP34 coinbase height commitment, and maximum
    /// serialized size. Only runs when the caller asked for `VERIFY_BODY`.
    fn verify_body(&self, block: &Block, entry: &ChainEntry, deployment_state: &DeploymentState, mtp: u32) -> Result<(), Error> {
        let serialized_len = bitcoin::consensus::encode::serialize(block).len() as u64;
        if serialized_len > deployment_state.max_block_size(&self.params.deployments) {
            return Err(VerifyError::invalid("bad-blk-length", 100).into());
        }

        let Some(coinbase) = block.txdata.first() else {
            return Err(VerifyError::invalid("bad-cb-missing", 100).into());
        };
        if !coinbase.is_coinbase() {
            return Err(VerifyError::invalid("bad-cb-missing", 100).into());
        }
        for tx in block.txdata.iter().skip(1) {
            if tx.is_coinbase() {
                return Err(VerifyError::invalid("bad-cb-multiple", 100).into());
            }
        }

        if deployment_state.magnetic_anomaly {
            self.verify_tx_ordering_and_size(block)?;
        }

        if deployment_state.wellington {
            for tx in &block.txdata {
                if tx.version.0 != 1 && tx.version.0 != 2 {
                    return Err(VerifyError::invalid("bad-txns-version", 0).into());
                }
            }
        }

        let use_mtp = deployment_state.lock_flags.intersects(VerifyFlags::CHECKLOCKTIMEVERIFY);
        for tx in &block.txdata {
            if !is_final_tx(tx, entry.height, entry.time, mtp, use_mtp) {
                return Err(VerifyError::invalid("bad-txns-nonfinal", 10).into());
            }
        }

        if deployment_state.bip34 {
            verify_coinbase_height(coinbase, entry.height)?;
        }

        Ok(())
    }

    fn verify_tx_ordering_and_size(&self, block: &Block) -> Result<(), Error> {
        let mut prev_txid: Option<[u8; 32]> = None;
        for tx in block.txdata.iter().skip(1) {
            if bitcoin::consensus::encode::serialize(tx).len() < MIN_TRANSACTION_SIZE {
                return Err(VerifyError::invalid("bad-txns-undersize", 10).into());
            }
            let txid = tx.compute_txid().to_byte_array();
            if let Some(prev) = prev_txid {
                if txid <= prev {
                    return Err(VerifyError::invalid("tx-ordering", 10).into());
                }
            }
            prev_txid = Some(txid);
        }
        Ok(())
    }

    /// BIP30: reject a block whose transaction IDs collide with a
    /// still-unspent coinbase from earlier history. Only consulted before
    /// BIP34 makes coinbase-height commitment (and hence txid uniqueness by
    /// construction) mandatory.
    async fn verify_duplicates(&self, block: &Block) -> Result<(), Error> {
        for tx in &block.txdata {
            let txid = tx.compute_txid();
            if self.db.has_coin(bitcoin::OutPoint { txid, vout: 0 }).await? {
                return Err(VerifyError::invalid("bad-txns-BIP30", 100).into());
            }
        }
        Ok(())
    }

    async fn check_sequence_lock(&self, coin: &Coin, input: &TxIn, prev: &ChainEntry) -> Result<(), Error> {
        let sequence = input.sequence.0;
        if sequence & (1 << 31) != 0 {
            return Ok(());
        }
        let relative = sequence & 0x0000_ffff;
        if sequence & (1 << 22) != 0 {
            let coin_prev = self.ancestor(prev, coin.height.saturating_sub(1)).await?;
            let coin_mtp = self.median_time_past(&coin_prev).await? as u64;
            let required = coin_mtp + (relative as u64) * 512;
            let prev_mtp = self.median_time_past(prev).await? as u64;
            if prev_mtp < required {
                return Err(VerifyError::invalid("bad-txns-nonfinal", 10).into());
            }
        } else {
            let required_height = coin.height + relative as u32;
            if prev.height + 1 < required_height {
                return Err(VerifyError::invalid("bad-txns-nonfinal", 10).into());
            }
        }
        Ok(())
    }

    /// Build the input-spending [`CoinView`] for `block`, dispatch every
    /// input's script through the [`WorkerPool`], sum the sigchecks each job
    /// reports per transaction and per block (enforcing `MAX_TX_SIGCHECKS`
    /// always and the block-wide cap only pre-Phonon), and enforce the
    /// coinbase subsidy and (while the Axion window is open) coinbase-rule
    /// checks. Returns the produced view and the block's total transaction
    /// fees.
    async fn verify_inputs(
        &self,
        entry: &ChainEntry,
        block: &Block,
        deployment_state: &DeploymentState,
    ) -> Result<(CoinView, u64), Error> {
        let mut view = CoinView::new();
        let mut jobs = Vec::new();
        let mut total_fees: u64 = 0;

        // Post Magnetic Anomaly, outputs of every transaction in the block
        // are visible to later transactions in the same block regardless of
        // position, so the view is pre-populated before spending begins;
        // pre Magnetic Anomaly a transaction may only spend outputs from
        // strictly earlier in the block, so outputs are added as each
        // transaction is processed instead.
        if deployment_state.magnetic_anomaly {
            for tx in &block.txdata {
                view.add_tx(tx, entry.height);
            }
        }

        for (tx_index, tx) in block.txdata.iter().enumerate() {
            if tx_index != 0 {
                let mut prevouts = Vec::with_capacity(tx.input.len());
                let mut input_value: u64 = 0;

                for input in &tx.input {
                    let outpoint = input.previous_output;
                    let coin = if let Some(coin) = view.take_local(&outpoint) {
                        coin
                    } else if let Some(coin) = self.db.read_coin(outpoint).await? {
                        view.mark_spent(outpoint, coin.clone());
                        coin
                    } else {
                        return Err(VerifyError::invalid("bad-txns-inputs-missingorspent", 10).into());
                    };

                    if deployment_state.flags.intersects(VerifyFlags::CHECKSEQUENCEVERIFY) && tx.version.0 >= 2 {
                        self.check_sequence_lock(&coin, input, entry).await?;
                    }

                    input_value = input_value.saturating_add(coin.output.value.to_sat());
                    prevouts.push(coin.output.clone());
                }

                let output_value: u64 = tx.output.iter().map(|o| o.value.to_sat()).sum();
                let fee = input_value
                    .checked_sub(output_value)
                    .ok_or_else(|| Error::from(VerifyError::invalid("bad-txns-in-belowout", 100)))?;
                total_fees = total_fees.saturating_add(fee);

                let ctx = Arc::new(TransactionContext::new(tx.clone(), prevouts.clone()));
                for (input_index, prevout) in prevouts.iter().enumerate() {
                    let script_pubkey = script::Script::from_bytes(prevout.script_pubkey.clone().into_bytes())
                        .map_err(|source| Error::ScriptVerify { index: input_index, txid: tx.compute_txid(), source })?;
                    jobs.push(ScriptJob {
                        ctx: Arc::clone(&ctx),
                        tx_index,
                        input_index,
                        script_pubkey,
                        prev_value: prevout.value,
                        flags: deployment_state.flags,
                    });
                }
            }

            if !deployment_state.magnetic_anomaly {
                view.add_tx(tx, entry.height);
            }
        }

        let sig_checks = self.workers.verify_all(jobs).await?;

        let mut per_tx_sigchecks: HashMap<usize, u32> = HashMap::new();
        let mut block_sigchecks: u64 = 0;
        for (tx_index, count) in sig_checks {
            *per_tx_sigchecks.entry(tx_index).or_insert(0) += count.0;
            block_sigchecks += count.0 as u64;
        }
        for count in per_tx_sigchecks.values() {
            if *count > MAX_TX_SIGCHECKS {
                return Err(VerifyError::invalid("bad-txn-sigchecks", 100).into());
            }
        }
        if !deployment_state.phonon {
            let serialized_len = bitcoin::consensus::encode::serialize(block).len() as u64;
            let max_block_sigchecks = serialized_len.saturating_mul(MAX_BLOCK_SIGCHECKS_PER_MB).div_ceil(1_000_000);
            if block_sigchecks > max_block_sigchecks {
                return Err(VerifyError::invalid("bad-blk-sigops", 100).into());
            }
        }

        let subsidy = self.params.deployments.block_subsidy(entry.height);
        let coinbase = &block.txdata[0];
        let coinbase_value: u64 = coinbase.output.iter().map(|o| o.value.to_sat()).sum();
        if coinbase_value > subsidy.saturating_add(total_fees) {
            return Err(VerifyError::invalid("bad-cb-amount", 100).into());
        }

        if deployment_state.axion && !deployment_state.wellington {
            let threshold = coinbase_value.saturating_mul(self.params.deployments.coinbase_rule_percent) / 100;
            let paid_to_fund: u64 = coinbase.output.iter().skip(1).map(|o| o.value.to_sat()).sum();
            if paid_to_fund < threshold {
                return Err(VerifyError::invalid("bad-cb-no-miner-fund", 0).into());
            }
        }

        Ok((view, total_fees))
    }

    async fn verify_context(
        &self,
        entry: &ChainEntry,
        block: &Block,
        prev: &ChainEntry,
        flags: VerifyFlags,
    ) -> Result<(DeploymentState, CoinView, u64), Error> {
        let mtp = self.median_time_past(prev).await?;
        let deployment_state = self.verify(entry, prev, mtp).await?;

        if !flags.intersects(VerifyFlags::VERIFY_BODY) {
            return Ok((deployment_state, CoinView::new(), 0));
        }

        self.verify_body(block, entry, &deployment_state, mtp)?;
        if !deployment_state.bip34 {
            self.verify_duplicates(block).await?;
        }
        let (view, fees) = self.verify_inputs(entry, block, &deployment_state).await?;
        Ok((deployment_state, view, fees))
    }

    /// Connect `block` atop `prev`: builds its entry, and either records it
    /// as a losing competitor (chainwork no greater than the current tip) or
    /// makes it the new best chain.
    async fn connect(&self, prev: &ChainEntry, block: Block, flags: VerifyFlags) -> Result<ChainEntry, Error> {
        let entry = ChainEntry::extend(prev, &block.header);
        let tip = self.tip().await?;

        if entry.chainwork <= tip.chainwork {
            self.verify_context(&entry, &block, prev, flags).await?;
            self.db.save(entry.clone(), block.clone(), None).await?;
            let _ = self.events.send(ChainEvent::Competitor(block, entry.clone()));
            Ok(entry)
        } else {
            self.set_best_chain(entry, block, prev, flags).await
        }
    }

    /// Make `entry`/`block` the new best chain, reorganizing away from the
    /// current tip first if `prev` is not already the tip.
    async fn set_best_chain(&self, entry: ChainEntry, block: Block, prev: &ChainEntry, flags: VerifyFlags) -> Result<ChainEntry, Error> {
        let tip = self.tip().await?;
        if prev.hash != tip.hash {
            self.reorganize(prev).await?;
        }

        let (_, view, _fees) = self.verify_context(&entry, &block, prev, flags).await?;

        self.db.save(entry.clone(), block.clone(), Some(view.clone())).await?;
        let _ = self.events.send(ChainEvent::Tip(entry.clone()));
        let _ = self.events.send(ChainEvent::Connect { entry: entry.clone(), block, view: Arc::new(view) });
        Ok(entry)
    }

    /// Unwind the chain from its current tip down to the fork point with
    /// `competitor_prev`'s ancestry, then reconnect every block on the
    /// competing branch up to (but not including) `competitor_prev`'s child
    /// -- the caller connects that last block itself.
    async fn reorganize(&self, competitor_prev: &ChainEntry) -> Result<(), Error> {
        let tip = self.tip().await?;
        let (_fork, disconnect_list, reconnect_list) = self.find_fork(&tip, competitor_prev).await?;

        let _ = self.events.send(ChainEvent::Reorganize { old_tip: tip.hash, new_tip: competitor_prev.hash });

        for entry in &disconnect_list {
            let block = self
                .db
                .get_block(entry.hash)
                .await?
                .ok_or_else(|| Error::Db(DbError::NotFound(entry.hash.to_string())))?;
            let view = self.db.disconnect(entry).await?;
            let _ = self.events.send(ChainEvent::Disconnect { entry: entry.clone(), block, view: Arc::new(view) });
        }

        for entry in &reconnect_list {
            let block = self
                .db
                .get_block(entry.hash)
                .await?
                .ok_or_else(|| Error::Db(DbError::NotFound(entry.hash.to_string())))?;
            let entry_prev = self
                .db
                .get_previous(entry)
                .await?
                .ok_or_else(|| Error::Db(DbError::Inconsistent("reconnected entry has no parent")))?;

            match self.verify_context(entry, &block, &entry_prev, VerifyFlags::VERIFY_BODY).await {
                Ok((_, view, _)) => {
                    self.db.reconnect(entry.clone(), block.clone(), view).await?;
                    let _ = self.events.send(ChainEvent::Reconnect { entry: entry.clone(), block });
                }
                Err(Error::Verify(source)) => {
                    return Err(Error::ReorganizeFailed { new_tip: competitor_prev.hash, failed_at: entry.hash, source });
                }
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }

    /// Walk `a` and `b` back to their lowest common ancestor, returning it
    /// plus the path from `a` down to it (tip-first) and from it up to `b`
    /// (fork-first).
    async fn find_fork(&self, a: &ChainEntry, b: &ChainEntry) -> Result<(ChainEntry, Vec<ChainEntry>, Vec<ChainEntry>), Error> {
        let mut left = a.clone();
        let mut right = b.clone();
        let mut disconnect = Vec::new();
        let mut reconnect = Vec::new();

        while left.height > right.height {
            disconnect.push(left.clone());
            left = self.db.get_previous(&left).await?.ok_or_else(|| Error::Db(DbError::Inconsistent("walked past genesis")))?;
        }
        while right.height > left.height {
            reconnect.push(right.clone());
            right = self.db.get_previous(&right).await?.ok_or_else(|| Error::Db(DbError::Inconsistent("walked past genesis")))?;
        }
        while left.hash != right.hash {
            disconnect.push(left.clone());
            reconnect.push(right.clone());
            left = self.db.get_previous(&left).await?.ok_or_else(|| Error::Db(DbError::Inconsistent("walked past genesis")))?;
            right = self.db.get_previous(&right).await?.ok_or_else(|| Error::Db(DbError::Inconsistent("walked past genesis")))?;
        }
        reconnect.reverse();
        Ok((left, disconnect, reconnect))
    }
}

/// Decode a BIP34 coinbase height commitment from the first push of a
/// coinbase's `scriptSig`: a minimally-encoded little-endian `CScriptNum`
/// with the sign carried in the top bit of its final byte.
fn decode_bip34_height(script_sig: &[u8]) -> Option<i64> {
    let len = *script_sig.first()? as usize;
    if len == 0 || len > 75 || script_sig.len() < 1 + len {
        return None;
    }
    let bytes = &script_sig[1..1 + len];
    let mut value: i64 = 0;
    for (i, &b) in bytes.iter().enumerate() {
        value |= (b as i64) << (8 * i);
    }
    if let Some(&last) = bytes.last() {
        if last & 0x80 != 0 {
            value &= !(0x80i64 << (8 * (bytes.len() - 1)));
            value = -value;
        }
    }
    Some(value)
}

fn verify_coinbase_height(coinbase: &Transaction, height: u32) -> Result<(), Error> {
    let script_sig = coinbase.input[0].script_sig.as_bytes();
    match decode_bip34_height(script_sig) {
        Some(decoded) if decoded == height as i64 => Ok(()),
        _ => Err(VerifyError::invalid("bad-cb-height", 100).into()),
    }
}

/// The reference `IsFinalTx`: a zero locktime is always final; otherwise
/// the locktime must already have passed (by height or by time/MTP
/// depending on `use_mtp`), or every input must carry a final (`0xffffffff`)
/// sequence number.
fn is_final_tx(tx: &Transaction, height: u32, block_time: u32, mtp: u32, use_mtp: bool) -> bool {
    let lock_time = tx.lock_time.to_consensus_u32();
    if lock_time == 0 {
        return true;
    }
    let reference = if use_mtp { mtp } else { block_time };
    let unlocked =
        if lock_time < LOCKTIME_THRESHOLD { lock_time < height } else { lock_time < reference };
    if unlocked {
        return true;
    }
    tx.input.iter().all(|input| input.sequence.0 == 0xffff_ffff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryChainDb;
    use crate::testing;

    fn open_chain() -> (Chain<MemoryChainDb>, EventReceiver) {
        let (_, genesis_entry, genesis_block) = testing::genesis();
        let db = MemoryChainDb::new(genesis_entry, genesis_block);
        let params = NetworkParams::regtest();
        Chain::open(db, params, 4)
    }

    #[tokio::test]
    async fn linear_chain_of_headers_connects_and_advances_the_tip() {
        let (chain, mut events) = open_chain();
        for (_, block) in testing::build_chain(5).into_iter().skip(1) {
            let entry = chain.add(block, VerifyFlags::empty(), 1).await.unwrap();
            assert!(entry.is_some());
        }
        let tip = chain.tip().await.unwrap();
        assert_eq!(tip.height, 5);

        let mut saw_tip_event = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ChainEvent::Tip(_)) {
                saw_tip_event = true;
            }
        }
        assert!(saw_tip_event);
    }

    #[tokio::test]
    async fn block_with_unknown_parent_is_stored_as_an_orphan() {
        let (chain, _events) = open_chain();
        let chain_blocks = testing::build_chain(2);
        let (_, dangling_block) = chain_blocks.into_iter().nth(2).unwrap();
        let result = chain.add(dangling_block, VerifyFlags::empty(), 7).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn heavier_fork_triggers_a_reorganization() {
        let (chain, _events) = open_chain();
        let main = testing::build_chain(3);
        for (_, block) in main.iter().skip(1).cloned() {
            chain.add(block, VerifyFlags::empty(), 1).await.unwrap();
        }
        let tip_before = chain.tip().await.unwrap();
        assert_eq!(tip_before.height, 3);

        let fork_point = &main[1].0;
        let fork = testing::build_fork(fork_point, 3, 9);
        for (_, block) in fork {
            chain.add(block, VerifyFlags::empty(), 2).await.unwrap();
        }

        let tip_after = chain.tip().await.unwrap();
        assert_eq!(tip_after.height, 4);
        assert_ne!(tip_after.hash, tip_before.hash);
    }

    #[tokio::test]
    async fn reset_discards_everything_above_the_named_entry() {
        let (chain, _events) = open_chain();
        let main = testing::build_chain(3);
        let fork_point_hash = main[1].0.hash;
        for (_, block) in main.into_iter().skip(1) {
            chain.add(block, VerifyFlags::empty(), 1).await.unwrap();
        }
        chain.reset(fork_point_hash).await.unwrap();
        let tip = chain.tip().await.unwrap();
        assert_eq!(tip.hash, fork_point_hash);
    }
}
