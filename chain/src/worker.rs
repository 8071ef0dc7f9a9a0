//! A bounded worker pool for dispatching per-input script verification
//! across tasks, so `verifyInputs` can check a block's inputs concurrently
//! without spawning one task per input unconditionally.

use std::sync::Arc;

use bitcoin::{Amount, Transaction, TxOut};
use script::interpreter::{SigCheckCount, SighashContext, TxContext};
use script::{Script, VerifyFlags};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::Error;

/// A [`TxContext`] over a real transaction and the previous outputs its
/// inputs spend, resolved from a [`crate::coinview::CoinView`] ahead of
/// dispatching verification jobs. Mirrors `script::testing::FixedTxContext`
/// but lives outside that crate's `testing`-feature gate since block
/// verification needs it unconditionally.
pub struct TransactionContext {
    tx: Transaction,
    prevouts: Vec<TxOut>,
}

impl TransactionContext {
    /// Build a context from a transaction and the outputs it spends, one
    /// per input, in order.
    pub fn new(tx: Transaction, prevouts: Vec<TxOut>) -> Self {
        TransactionContext { tx, prevouts }
    }
}

impl SighashContext for TransactionContext {
    fn transaction(&self) -> &Transaction {
        &self.tx
    }

    fn prevout(&self, index: usize) -> Option<&TxOut> {
        self.prevouts.get(index)
    }
}

impl TxContext for TransactionContext {
    fn lock_time(&self) -> u32 {
        self.tx.lock_time.to_consensus_u32()
    }

    fn input_sequence(&self, index: usize) -> u32 {
        self.tx.input[index].sequence.0
    }

    fn version(&self) -> i32 {
        self.tx.version.0
    }
}

/// One input's script verification job.
pub struct ScriptJob {
    /// The spending transaction plus its resolved previous outputs.
    pub ctx: Arc<TransactionContext>,
    /// Index of the transaction within the block, used to attribute this
    /// job's sigcheck count back to its transaction once the pool returns.
    pub tx_index: usize,
    /// Index of the input within the transaction being verified.
    pub input_index: usize,
    /// The previous output's locking script.
    pub script_pubkey: Script,
    /// The previous output's value, needed for the BIP143/FORKID sighash.
    pub prev_value: Amount,
    /// Verification flags in force for this block.
    pub flags: VerifyFlags,
}

/// Dispatches [`ScriptJob`]s across a bounded number of concurrent tasks and
/// collects every result, short-circuiting as soon as one input fails.
///
/// Bounded via a [`Semaphore`] rather than limiting `JoinSet` itself, since
/// `JoinSet` has no native concurrency cap: jobs still all get spawned, but
/// each awaits a permit before doing real work, keeping at most
/// `concurrency` script verifications running at once.
pub struct WorkerPool {
    concurrency: Arc<Semaphore>,
}

impl WorkerPool {
    /// Build a pool that runs at most `concurrency` verifications at a time.
    pub fn new(concurrency: usize) -> Self {
        WorkerPool { concurrency: Arc::new(Semaphore::new(concurrency.max(1))) }
    }

    /// Verify every job's script, returning as soon as all have completed
    /// successfully or any one of them fails.
    ///
    /// On success, returns each job's `(tx_index, SigCheckCount)` so the
    /// caller can sum sigchecks per transaction and per block; the order of
    /// the returned entries is not meaningful, since jobs complete as their
    /// tasks finish rather than in dispatch order.
    pub async fn verify_all(&self, jobs: Vec<ScriptJob>) -> Result<Vec<(usize, SigCheckCount)>, Error> {
        let mut set = JoinSet::new();
        for job in jobs {
            let permit = Arc::clone(&self.concurrency);
            set.spawn(async move {
                let _permit = permit.acquire_owned().await.expect("semaphore is never closed");
                verify_one(job)
            });
        }

        let mut first_error = None;
        let mut counts = Vec::new();
        while let Some(result) = set.join_next().await {
            match result {
                Ok(Ok(entry)) => counts.push(entry),
                Ok(Err(err)) if first_error.is_none() => first_error = Some(err),
                Ok(Err(_)) => {}
                Err(_) => {
                    if first_error.is_none() {
                        first_error = Some(Error::WorkerFailed);
                    }
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(counts),
        }
    }
}

fn verify_one(job: ScriptJob) -> Result<(usize, SigCheckCount), Error> {
    let tx = job.ctx.transaction();
    let txid = tx.compute_txid();
    let input = tx.input.get(job.input_index).expect("caller resolved a valid input index");
    let script_sig = Script::from_bytes(input.script_sig.clone().into_bytes())
        .map_err(|source| Error::ScriptVerify { index: job.input_index, txid, source })?;

    let sig_checks = script::interpreter::verify(&script_sig, &job.script_pubkey, job.ctx.as_ref(), job.input_index, job.prev_value, job.flags)
        .map_err(|source| Error::ScriptVerify { index: job.input_index, txid, source })?;
    Ok((job.tx_index, sig_checks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::{OutPoint, ScriptBuf, Sequence, TxIn, Witness};
    use script::opcode::OP_1;

    fn trivial_tx() -> Transaction {
        Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![],
        }
    }

    #[tokio::test]
    async fn pool_runs_a_trivially_true_job_to_completion() {
        let pool = WorkerPool::new(2);
        let prev_output = TxOut { value: Amount::from_sat(1), script_pubkey: ScriptBuf::new() };
        let ctx = Arc::new(TransactionContext::new(trivial_tx(), vec![prev_output]));
        let job = ScriptJob {
            ctx,
            tx_index: 0,
            input_index: 0,
            script_pubkey: Script::from_bytes(vec![OP_1]).unwrap(),
            prev_value: Amount::from_sat(1),
            flags: VerifyFlags::empty(),
        };
        let result = pool.verify_all(vec![job]).await;
        let counts = result.expect("verification succeeds");
        assert_eq!(counts, vec![(0, SigCheckCount(0))]);
    }
}
