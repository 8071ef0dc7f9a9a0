//! [`CoinView`]: an in-memory overlay of unspent-output changes produced
//! while verifying a single block or a single step of a reorganization.

use std::collections::HashMap;

use bitcoin::{OutPoint, Transaction, TxOut};

/// A transaction output as tracked by a [`CoinView`], plus the provenance
/// needed to enforce coinbase-maturity and BIP30 duplicate-coinbase rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coin {
    /// The output itself.
    pub output: TxOut,
    /// Height of the block that created this output.
    pub height: u32,
    /// Whether this output originated from a coinbase transaction.
    pub is_coinbase: bool,
}

/// A layered view over the confirmed UTXO set: outputs added during this
/// block/step live in `added`, spends of pre-existing coins are recorded in
/// `spent` rather than mutating the underlying store directly, so the whole
/// overlay can be discarded on verification failure without having touched
/// durable state.
#[derive(Debug, Default, Clone)]
pub struct CoinView {
    added: HashMap<OutPoint, Coin>,
    spent: HashMap<OutPoint, Coin>,
}

impl CoinView {
    /// An empty overlay, as used for SPV-mode contextual verification where
    /// no UTXO set is available to check against.
    pub fn new() -> Self {
        CoinView { added: HashMap::new(), spent: HashMap::new() }
    }

    /// Look up a coin, checking this overlay's additions before falling back
    /// to `base` (the durable store, or another overlay being stacked on).
    pub fn get<'a>(&'a self, outpoint: &OutPoint, base: impl Fn(&OutPoint) -> Option<&'a Coin>) -> Option<&'a Coin> {
        if self.spent.contains_key(outpoint) {
            return None;
        }
        if let Some(coin) = self.added.get(outpoint) {
            return Some(coin);
        }
        base(outpoint)
    }

    /// Mark `outpoint` spent, returning the coin that was spent so the
    /// caller can read its value/height for fee accounting and maturity
    /// checks. Returns `None` if the outpoint is unknown to this view (the
    /// caller resolves that as `bad-txns-inputs-missingorspent`).
    pub fn spend(&mut self, outpoint: OutPoint, resolve: impl FnOnce(&OutPoint) -> Option<Coin>) -> Option<Coin> {
        if let Some(coin) = self.added.remove(&outpoint) {
            self.spent.insert(outpoint, coin.clone());
            return Some(coin);
        }
        let coin = resolve(&outpoint)?;
        self.spent.insert(outpoint, coin.clone());
        Some(coin)
    }

    /// Remove and return `outpoint` from this view's own additions, without
    /// consulting any base store. Used by callers that must resolve the
    /// base-store lookup themselves (e.g. asynchronously) before deciding
    /// how to record the spend.
    pub fn take_local(&mut self, outpoint: &OutPoint) -> Option<Coin> {
        let coin = self.added.remove(outpoint)?;
        self.spent.insert(*outpoint, coin.clone());
        Some(coin)
    }

    /// Record `coin`, already resolved from a base store, as spent.
    pub fn mark_spent(&mut self, outpoint: OutPoint, coin: Coin) {
        self.spent.insert(outpoint, coin);
    }

    /// Add every output of `tx` to the view at `height`.
    pub fn add_tx(&mut self, tx: &Transaction, height: u32) {
        let is_coinbase = tx.is_coinbase();
        let txid = tx.compute_txid();
        for (vout, output) in tx.output.iter().enumerate() {
            let outpoint = OutPoint { txid, vout: vout as u32 };
            self.added.insert(outpoint, Coin { output: output.clone(), height, is_coinbase });
        }
    }

    /// Whether this view (including its additions, excluding its spends)
    /// believes `outpoint` exists, without consulting a base store.
    pub fn has_local(&self, outpoint: &OutPoint) -> bool {
        !self.spent.contains_key(outpoint) && self.added.contains_key(outpoint)
    }

    /// Decompose the view into its spent and added coin lists, consuming
    /// it. Used by [`crate::db::ChainDb`] implementations to persist (or
    /// later undo) exactly the changes this view represents.
    pub fn into_changes(self) -> (Vec<(OutPoint, Coin)>, Vec<(OutPoint, Coin)>) {
        (self.spent.into_iter().collect(), self.added.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, ScriptBuf, Sequence, TxIn, Witness};

    fn sample_tx() -> Transaction {
        Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut { value: Amount::from_sat(5_000_000_000), script_pubkey: ScriptBuf::new() }],
        }
    }

    #[test]
    fn spend_then_get_reports_the_coin_gone() {
        let tx = sample_tx();
        let mut view = CoinView::new();
        view.add_tx(&tx, 0);
        let outpoint = OutPoint { txid: tx.compute_txid(), vout: 0 };
        assert!(view.has_local(&outpoint));

        let spent = view.spend(outpoint, |_| None);
        assert!(spent.is_some());
        assert!(!view.has_local(&outpoint));
    }

    #[test]
    fn spend_of_unknown_outpoint_falls_back_to_resolver() {
        let mut view = CoinView::new();
        let outpoint = OutPoint::null();
        let resolved =
            Coin { output: TxOut { value: Amount::from_sat(1), script_pubkey: ScriptBuf::new() }, height: 3, is_coinbase: false };
        let spent = view.spend(outpoint, |_| Some(resolved.clone()));
        assert_eq!(spent, Some(resolved));
    }
}
