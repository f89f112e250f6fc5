//! Cluster membership as a consumed interface (spec §1, §4.5): "a `Peer`
//! that exposes list current peers of type T and my identity". The gossip
//! implementation itself is an external collaborator; this module only
//! specifies the trait the consumer drives and a minimal static backing
//! sufficient to run end-to-end without a real membership protocol.

use async_trait::async_trait;

/// What kind of peer a caller wants to discover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    Ingest,
    Store,
}

/// Directory of reachable peers, addressed by base URL (e.g.
/// `http://host:7003`).
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    async fn peers(&self, kind: PeerKind) -> Vec<String>;
    fn self_id(&self) -> &str;
}

/// A fixed peer list read once from configuration. Adequate until a real
/// gossip/membership layer is wired in -- full membership discovery is
/// explicitly out of scope here.
pub struct StaticPeerDirectory {
    ingest_peers: Vec<String>,
    store_peers: Vec<String>,
    self_id: String,
}

impl StaticPeerDirectory {
    pub fn new(ingest_peers: Vec<String>, store_peers: Vec<String>, self_id: impl Into<String>) -> Self {
        StaticPeerDirectory {
            ingest_peers,
            store_peers,
            self_id: self_id.into(),
        }
    }
}

#[async_trait]
impl PeerDirectory for StaticPeerDirectory {
    async fn peers(&self, kind: PeerKind) -> Vec<String> {
        match kind {
            PeerKind::Ingest => self.ingest_peers.clone(),
            PeerKind::Store => self.store_peers.clone(),
        }
    }

    fn self_id(&self) -> &str {
        &self.self_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_directory_returns_configured_peers_by_kind() {
        let dir = StaticPeerDirectory::new(
            vec!["http://a:7000".to_string()],
            vec!["http://b:7003".to_string()],
            "node-1",
        );
        assert_eq!(dir.peers(PeerKind::Ingest).await, vec!["http://a:7000".to_string()]);
        assert_eq!(dir.peers(PeerKind::Store).await, vec!["http://b:7003".to_string()]);
        assert_eq!(dir.self_id(), "node-1");
    }
}
