//! Store-side consumer loop: discover ingest peers, claim their oldest
//! flushed segment, append it to the store, and commit or fail the claim
//! (spec §4.5).

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::metrics::Metrics;
use crate::peer::{PeerDirectory, PeerKind};
use crate::store::StoreLog;

const SEGMENT_TOKEN_HEADER: &str = "X-Segment-Token";

struct ClaimedSegment {
    token: String,
    body: Vec<u8>,
}

pub struct Consumer {
    peers: Arc<dyn PeerDirectory>,
    store: Arc<StoreLog>,
    metrics: Arc<Metrics>,
    http: reqwest::Client,
    claim_timeout: Duration,
    backoff: Duration,
}

impl Consumer {
    pub fn new(
        peers: Arc<dyn PeerDirectory>,
        store: Arc<StoreLog>,
        metrics: Arc<Metrics>,
        claim_timeout: Duration,
        backoff: Duration,
    ) -> Self {
        Consumer {
            peers,
            store,
            metrics,
            http: reqwest::Client::new(),
            claim_timeout,
            backoff,
        }
    }

    async fn claim(&self, base: &str) -> anyhow::Result<Option<ClaimedSegment>> {
        let resp = self
            .http
            .get(format!("{base}/ingest/next"))
            .timeout(self.claim_timeout)
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            anyhow::bail!("claim at {base} returned {}", resp.status());
        }

        let token = resp
            .headers()
            .get(SEGMENT_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| anyhow::anyhow!("claim response from {base} missing {SEGMENT_TOKEN_HEADER}"))?
            .to_string();
        let body = resp.bytes().await?.to_vec();
        Ok(Some(ClaimedSegment { token, body }))
    }

    async fn commit_at(&self, base: &str, token: &str) -> anyhow::Result<()> {
        self.http
            .post(format!("{base}/ingest/commit"))
            .query(&[("token", token)])
            .timeout(self.claim_timeout)
            .send()
            .await?;
        Ok(())
    }

    async fn fail_at(&self, base: &str, token: &str) -> anyhow::Result<()> {
        self.http
            .post(format!("{base}/ingest/fail"))
            .query(&[("token", token)])
            .timeout(self.claim_timeout)
            .send()
            .await?;
        Ok(())
    }

    /// One discover-claim-ingest cycle. Returns whether a segment was
    /// consumed, so the caller can skip the back-off sleep when there is
    /// likely more work waiting.
    async fn run_pass(&self) -> bool {
        let mut candidates = self.peers.peers(PeerKind::Ingest).await;
        if candidates.is_empty() {
            return false;
        }
        shuffle(&mut candidates);

        for base in &candidates {
            Metrics::inc(&self.metrics.claims_attempted);
            let claimed = match self.claim(base).await {
                Ok(Some(c)) => c,
                Ok(None) => {
                    Metrics::inc(&self.metrics.claims_empty);
                    continue;
                }
                Err(e) => {
                    Metrics::inc(&self.metrics.consumer_errors);
                    log::warn!("claim at {base} failed: {e}");
                    continue;
                }
            };

            match self.store.append(&claimed.body).await {
                Ok(_) => {
                    if let Err(e) = self.commit_at(base, &claimed.token).await {
                        Metrics::inc(&self.metrics.consumer_errors);
                        log::warn!("commit at {base} for token {} failed: {e}", claimed.token);
                    }
                }
                Err(e) => {
                    log::warn!("append of segment claimed from {base} failed: {e}");
                    if let Err(e) = self.fail_at(base, &claimed.token).await {
                        Metrics::inc(&self.metrics.consumer_errors);
                        log::warn!("fail at {base} for token {} failed: {e}", claimed.token);
                    }
                }
            }
            return true;
        }
        false
    }

    /// Runs passes continuously until cancelled, backing off (jittered)
    /// after a pass that consumed nothing.
    pub async fn run(self: Arc<Self>, mut cancel: tokio::sync::watch::Receiver<bool>) -> anyhow::Result<()> {
        loop {
            if *cancel.borrow() {
                return Ok(());
            }
            let consumed = self.run_pass().await;
            if consumed {
                continue;
            }
            let jitter = rand::rng().random_range(0..=self.backoff.as_millis() as u64 / 2 + 1);
            let sleep = self.backoff + Duration::from_millis(jitter);
            tokio::select! {
                _ = cancel.changed() => return Ok(()),
                _ = tokio::time::sleep(sleep) => {}
            }
        }
    }
}

fn shuffle(items: &mut [String]) {
    use rand::seq::SliceRandom;
    items.shuffle(&mut rand::rng());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::StaticPeerDirectory;
    use ledgerd_core::{Filesystem, MemFilesystem};
    use std::path::PathBuf;

    #[tokio::test]
    async fn run_pass_with_no_peers_returns_false_without_panicking() {
        let fs: Arc<dyn Filesystem> = Arc::new(MemFilesystem::new());
        let store = Arc::new(
            StoreLog::open(PathBuf::from("/store"), fs, u64::MAX, Duration::from_secs(60))
                .await
                .unwrap(),
        );
        let peers = Arc::new(StaticPeerDirectory::new(vec![], vec![], "node-1"));
        let consumer = Consumer::new(peers, store, Arc::new(Metrics::new()), Duration::from_secs(1), Duration::from_millis(10));
        assert!(!consumer.run_pass().await);
    }

    #[tokio::test]
    async fn claim_against_unreachable_peer_counts_as_error_not_panic() {
        let fs: Arc<dyn Filesystem> = Arc::new(MemFilesystem::new());
        let store = Arc::new(
            StoreLog::open(PathBuf::from("/store"), fs, u64::MAX, Duration::from_secs(60))
                .await
                .unwrap(),
        );
        let peers = Arc::new(StaticPeerDirectory::new(
            vec!["http://127.0.0.1:1".to_string()],
            vec![],
            "node-1",
        ));
        let metrics = Arc::new(Metrics::new());
        let consumer = Consumer::new(peers, store, metrics.clone(), Duration::from_millis(200), Duration::from_millis(10));
        assert!(!consumer.run_pass().await);
        assert_eq!(Metrics::get(&metrics.consumer_errors), 1);
    }
}
