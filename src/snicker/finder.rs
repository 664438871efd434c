//! Scan a block range for SNICKER candidates
//!
//! Blocks are fetched with bounded concurrency but processed strictly in
//! height order, so the candidates log reads top to bottom like the chain.
//! Structural matches can additionally be checked against the values of the
//! outputs they spend.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use bdk_wallet::bitcoin::{consensus::encode::serialize_hex, Block, Transaction};
use futures::stream::{self, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use super::pattern::{classify, classify_with_prevouts, human_readable_transaction};
use super::CandidateMatch;
use crate::blockchain_data::{BlockchainDataError, BlockchainDataProvider};
use crate::network::RetryPolicy;

/// How a block range is fetched
#[derive(Debug, Clone, Copy)]
pub struct FinderOptions {
    /// Blocks requested at the same time
    pub concurrency: usize,
    /// Per-request retry for connectivity failures
    pub retry: RetryPolicy,
    /// Fetch prevouts and require plausible values
    pub check_values: bool,
}

impl Default for FinderOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            retry: RetryPolicy::default(),
            check_values: true,
        }
    }
}

/// Summary of a finished (or cancelled) scan
#[derive(Debug, Clone, Default)]
pub struct FinderReport {
    /// Candidates in block order, then in-block order
    pub candidates: Vec<CandidateMatch>,
    pub blocks_scanned: usize,
    /// Heights whose fetch still failed after all retries
    pub failed_blocks: Vec<u32>,
    pub cancelled: bool,
}

/// Append-only text log of found candidates
///
/// Each entry is `Found: <txid> in block: <height>`, a readable dump of the
/// transaction and its full hex, so a proposer can pick it up later.
pub struct CandidateLog {
    path: PathBuf,
}

impl CandidateLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, candidate: &CandidateMatch) -> Result<()> {
        let entry = format_log_entry(candidate);

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open candidates file: {}", self.path.display()))?;
        file.write_all(entry.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

fn format_log_entry(candidate: &CandidateMatch) -> String {
    format!(
        "Found: {} in block: {}\n{}{}\n",
        candidate.txid(),
        candidate.block_height,
        human_readable_transaction(&candidate.tx),
        serialize_hex(&candidate.tx)
    )
}

/// Scan blocks `start..=end` for candidate transactions
///
/// A block that still fails after its retries is logged, recorded in
/// [`FinderReport::failed_blocks`] and skipped; the rest of the range is
/// still scanned. Cancellation stops the scan and returns what was found.
///
/// # Errors
/// An empty range, or a failure writing the candidates log.
pub async fn find_candidates<P>(
    provider: &P,
    start: u32,
    end: u32,
    options: &FinderOptions,
    log: Option<&CandidateLog>,
    cancel: &CancellationToken,
) -> Result<FinderReport>
where
    P: BlockchainDataProvider + ?Sized,
{
    if start > end {
        bail!("Start block {} is above end block {}", start, end);
    }

    tracing::info!(
        "🔎 Scanning blocks {}..={} for SNICKER candidates",
        start,
        end
    );

    let options = *options;
    let mut blocks = std::pin::pin!(stream::iter(start..=end)
        .map(|height| async move {
            let fetched = options
                .retry
                .run(
                    &format!("Fetching block {}", height),
                    || provider.get_block(height),
                    BlockchainDataError::is_retryable,
                )
                .await;
            let screened = match fetched {
                Ok(block) => Ok(screen_block(provider, block, &options).await),
                Err(e) => Err(e),
            };
            (height, screened)
        })
        .buffered(options.concurrency.max(1)));

    let mut report = FinderReport::default();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!("🛑 Candidate scan cancelled");
                report.cancelled = true;
                break;
            }
            next = blocks.next() => next,
        };
        let Some((height, result)) = next else {
            break;
        };

        let matches = match result {
            Ok(matches) => matches,
            Err(e) => {
                tracing::warn!("⚠️  Skipping block {} after failed fetch: {}", height, e);
                report.failed_blocks.push(height);
                continue;
            }
        };
        report.blocks_scanned += 1;

        for tx in matches {
            let candidate = CandidateMatch {
                block_height: height,
                tx,
            };
            tracing::info!("Found: {} in block: {}", candidate.txid(), height);
            if let Some(log) = log {
                log.append(&candidate).await?;
            }
            report.candidates.push(candidate);
        }

        if report.blocks_scanned % 100 == 0 {
            tracing::info!("📊 Scanned {} blocks (at height {})", report.blocks_scanned, height);
        }
    }

    tracing::info!(
        "🔎 Scan complete: {} blocks, {} candidates, {} failed blocks",
        report.blocks_scanned,
        report.candidates.len(),
        report.failed_blocks.len()
    );

    Ok(report)
}

/// Candidate transactions of one block, in block order
async fn screen_block<P>(provider: &P, block: Block, options: &FinderOptions) -> Vec<Transaction>
where
    P: BlockchainDataProvider + ?Sized,
{
    let mut matches = Vec::new();
    for tx in block.txdata {
        if !classify(&tx) {
            continue;
        }
        if options.check_values && !values_plausible(provider, &tx, &options.retry).await {
            continue;
        }
        matches.push(tx);
    }
    matches
}

/// Check a structural match against the outputs it spends
///
/// When the prevouts cannot be fetched the structural match stands.
async fn values_plausible<P>(provider: &P, tx: &Transaction, retry: &RetryPolicy) -> bool
where
    P: BlockchainDataProvider + ?Sized,
{
    let txid = tx.compute_txid();
    let prevouts = retry
        .run(
            &format!("Fetching prevouts of {}", txid),
            || provider.get_prevouts(txid),
            BlockchainDataError::is_retryable,
        )
        .await;

    match prevouts {
        Ok(prevouts) => {
            let plausible = classify_with_prevouts(tx, &prevouts);
            if !plausible {
                tracing::debug!("Skipping {}: values do not fit a two-party spend", txid);
            }
            plausible
        }
        Err(e) => {
            tracing::warn!(
                "⚠️  Could not fetch prevouts of {}, keeping structural match: {}",
                txid,
                e
            );
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use bdk_wallet::bitcoin::{
        absolute::LockTime, block::Header, block::Version as BlockVersion, hashes::Hash,
        transaction::Version, Amount, Block, BlockHash, CompactTarget, OutPoint, ScriptBuf,
        Sequence, Transaction, TxIn, TxMerkleNode, TxOut, Txid, Witness,
    };

    struct MockChain {
        blocks: HashMap<u32, Block>,
        /// Heights that fail this many times before succeeding
        flaky: HashMap<u32, u32>,
        attempts: AtomicU32,
        /// Known spent outputs; other lookups fail
        prevouts: HashMap<Txid, Vec<TxOut>>,
    }

    #[async_trait::async_trait]
    impl BlockchainDataProvider for MockChain {
        async fn get_block(&self, height: u32) -> Result<Block, BlockchainDataError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if let Some(&failures) = self.flaky.get(&height) {
                if attempt < failures {
                    return Err(BlockchainDataError::Status {
                        status: 503,
                        url: format!("mock/{}", height),
                    });
                }
            }
            self.blocks
                .get(&height)
                .cloned()
                .ok_or(BlockchainDataError::Status {
                    status: 503,
                    url: format!("mock/{}", height),
                })
        }

        async fn get_tip_height(&self) -> Result<u32, BlockchainDataError> {
            Ok(self.blocks.keys().copied().max().unwrap_or(0))
        }

        async fn broadcast(&self, tx: &Transaction) -> Result<Txid, BlockchainDataError> {
            Ok(tx.compute_txid())
        }

        async fn estimate_fee(&self, _target_blocks: u32) -> Result<f64, BlockchainDataError> {
            Ok(1.0)
        }

        async fn get_prevouts(&self, txid: Txid) -> Result<Vec<TxOut>, BlockchainDataError> {
            self.prevouts
                .get(&txid)
                .cloned()
                .ok_or_else(|| BlockchainDataError::ParseError(format!("unknown tx {}", txid)))
        }
    }

    fn p2wpkh_witness(filler: u8) -> Witness {
        let mut sig = vec![0x30];
        sig.extend_from_slice(&[filler; 70]);
        let mut pubkey = vec![0x02];
        pubkey.extend_from_slice(&[filler; 32]);
        Witness::from_slice(&[sig, pubkey])
    }

    fn p2wpkh_output(value: u64) -> TxOut {
        TxOut {
            value: Amount::from_sat(value),
            script_pubkey: ScriptBuf::from_hex("0014ffffffffffffffffffffffffffffffffffffffff").unwrap(),
        }
    }

    fn tx(inputs: usize, outputs: &[u64], seed: u8) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: (0..inputs)
                .map(|i| TxIn {
                    previous_output: OutPoint {
                        txid: Txid::from_byte_array([seed; 32]),
                        vout: i as u32,
                    },
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: p2wpkh_witness(seed),
                })
                .collect(),
            output: outputs.iter().map(|&v| p2wpkh_output(v)).collect(),
        }
    }

    fn block(txdata: Vec<Transaction>) -> Block {
        Block {
            header: Header {
                version: BlockVersion::ONE,
                prev_blockhash: BlockHash::all_zeros(),
                merkle_root: TxMerkleNode::all_zeros(),
                time: 0,
                bits: CompactTarget::from_consensus(0),
                nonce: 0,
            },
            txdata,
        }
    }

    fn chain() -> MockChain {
        let mut blocks = HashMap::new();
        blocks.insert(100, block(vec![tx(1, &[50_000], 1), tx(2, &[50_000, 30_000], 2)]));
        blocks.insert(101, block(vec![tx(2, &[50_000, 30_000, 1_000], 3)]));
        blocks.insert(102, block(vec![tx(2, &[40_000, 20_000], 4), tx(2, &[9_000, 8_000], 5)]));
        MockChain {
            blocks,
            flaky: HashMap::new(),
            attempts: AtomicU32::new(0),
            prevouts: HashMap::new(),
        }
    }

    fn fast_options() -> FinderOptions {
        FinderOptions {
            concurrency: 2,
            retry: RetryPolicy::new(2, Duration::from_millis(1)),
            check_values: true,
        }
    }

    #[tokio::test]
    async fn test_finds_candidates_in_order() {
        let report = find_candidates(&chain(), 100, 102, &fast_options(), None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.blocks_scanned, 3);
        assert!(report.failed_blocks.is_empty());
        let found: Vec<(u32, Txid)> = report
            .candidates
            .iter()
            .map(|c| (c.block_height, c.txid()))
            .collect();
        assert_eq!(
            found,
            vec![
                (100, tx(2, &[50_000, 30_000], 2).compute_txid()),
                (102, tx(2, &[40_000, 20_000], 4).compute_txid()),
                (102, tx(2, &[9_000, 8_000], 5).compute_txid()),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_block_is_skipped() {
        // Height 103 does not exist and keeps failing
        let report = find_candidates(&chain(), 101, 103, &fast_options(), None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.failed_blocks, vec![103]);
        assert_eq!(report.blocks_scanned, 2);
        assert_eq!(report.candidates.len(), 2);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let mut chain = chain();
        chain.flaky.insert(100, 1);
        let options = FinderOptions {
            concurrency: 1,
            retry: RetryPolicy::new(3, Duration::from_millis(1)),
            check_values: false,
        };

        let report = find_candidates(&chain, 100, 100, &options, None, &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.failed_blocks.is_empty());
        assert_eq!(report.candidates.len(), 1);
        assert_eq!(chain.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_implausible_values_excluded() {
        let mut chain = chain();
        let implausible = tx(2, &[50_000, 30_000], 2);
        let plausible = tx(2, &[40_000, 20_000], 4);
        // Implied fee of 1_920_000 sats
        chain
            .prevouts
            .insert(implausible.compute_txid(), vec![p2wpkh_output(1_000_000); 2]);
        chain.prevouts.insert(
            plausible.compute_txid(),
            vec![p2wpkh_output(40_500), p2wpkh_output(20_000)],
        );

        let report = find_candidates(&chain, 100, 102, &fast_options(), None, &CancellationToken::new())
            .await
            .unwrap();

        // tx 5 has no known prevouts and keeps its structural match
        let found: Vec<Txid> = report.candidates.iter().map(|c| c.txid()).collect();
        assert_eq!(
            found,
            vec![plausible.compute_txid(), tx(2, &[9_000, 8_000], 5).compute_txid()]
        );
    }

    #[tokio::test]
    async fn test_value_check_can_be_disabled() {
        let mut chain = chain();
        let implausible = tx(2, &[50_000, 30_000], 2);
        chain
            .prevouts
            .insert(implausible.compute_txid(), vec![p2wpkh_output(1_000_000); 2]);
        let options = FinderOptions {
            check_values: false,
            ..fast_options()
        };

        let report = find_candidates(&chain, 100, 100, &options, None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.candidates.len(), 1);
        assert_eq!(report.candidates[0].txid(), implausible.compute_txid());
    }

    #[tokio::test]
    async fn test_candidate_log_entries() {
        let dir = tempfile::tempdir().unwrap();
        let log = CandidateLog::new(dir.path().join("candidates.txt"));

        find_candidates(&chain(), 100, 102, &fast_options(), Some(&log), &CancellationToken::new())
            .await
            .unwrap();

        let contents = tokio::fs::read_to_string(log.path()).await.unwrap();
        let first = tx(2, &[50_000, 30_000], 2);
        assert!(contents.starts_with(&format!("Found: {} in block: 100\n", first.compute_txid())));
        assert!(contents.contains(&serialize_hex(&first)));
        assert_eq!(contents.matches("Found: ").count(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_scan() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = find_candidates(&chain(), 100, 102, &fast_options(), None, &cancel)
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.blocks_scanned, 0);
    }

    #[tokio::test]
    async fn test_empty_range_rejected() {
        let result = find_candidates(&chain(), 5, 4, &fast_options(), None, &CancellationToken::new()).await;
        assert!(result.is_err());
    }
}
