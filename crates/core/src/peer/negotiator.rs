//! Candidate negotiation
//!
//! Pairs are checked phase by phase: direct IPv6, direct IPv4, relay IPv6,
//! relay IPv4. Checks inside a phase run concurrently and the fastest success
//! wins; the first phase with any success ends negotiation. Relay phases only
//! run once every direct pair failed or the direct stage ran out of time.

use super::candidate::{form_pairs, Candidate, CandidatePair, CheckPhase};
use crate::config::IceConfig;
use crate::credentials::{RelayCredential, RelayCredentialProvider};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The embedder's ICE agent as seen by the negotiator
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// Gather local candidates; relay candidates need `relay`
    async fn local_candidates(&self, relay: Option<&RelayCredential>) -> Result<Vec<Candidate>>;

    /// Run one connectivity check and report its round-trip time
    async fn check(&self, pair: &CandidatePair) -> Result<Duration>;

    /// Session description sent in the Offer/Answer
    async fn local_description(&self, connection_id: &str) -> Result<String> {
        Ok(format!("remotedesk/1 connection={}", connection_id))
    }

    /// Apply the peer's session description
    async fn apply_remote_description(&self, _connection_id: &str, _sdp: &str) -> Result<()> {
        Ok(())
    }
}

/// Outcome of a successful negotiation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedPath {
    pub pair: CandidatePair,
    pub rtt_ms: f64,
    pub is_relay: bool,
}

/// Lowest RTT wins; on equal RTT a direct pair beats a relayed one
pub fn select_best(results: &[(CandidatePair, Duration)]) -> Option<(CandidatePair, Duration)> {
    results
        .iter()
        .copied()
        .min_by_key(|(pair, rtt)| (*rtt, pair.is_relay()))
}

/// Runs connectivity checks in fallback order
pub struct CandidateNegotiator {
    config: IceConfig,
    probe: Arc<dyn ConnectivityProbe>,
    relay: Option<Arc<dyn RelayCredentialProvider>>,
}

impl std::fmt::Debug for CandidateNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandidateNegotiator")
            .field("config", &self.config)
            .field("relay", &self.relay.is_some())
            .finish()
    }
}

impl CandidateNegotiator {
    pub fn new(
        config: IceConfig,
        probe: Arc<dyn ConnectivityProbe>,
        relay: Option<Arc<dyn RelayCredentialProvider>>,
    ) -> Self {
        Self {
            config,
            probe,
            relay,
        }
    }

    /// Probe used for descriptions and checks
    pub fn probe(&self) -> &Arc<dyn ConnectivityProbe> {
        &self.probe
    }

    /// Gather local candidates with a freshly minted relay credential
    pub async fn gather(&self, local_device_id: &str) -> Result<Vec<Candidate>> {
        let credential = match &self.relay {
            Some(provider) => match provider.relay_credential(local_device_id).await {
                Ok(c) => Some(c),
                Err(e) => {
                    warn!("No relay credential, gathering without relay: {}", e);
                    None
                }
            },
            None => None,
        };

        let candidates = self.probe.local_candidates(credential.as_ref()).await?;
        debug!("Gathered {} local candidates", candidates.len());
        Ok(candidates)
    }

    /// Select a path between `local` and `remote` candidates
    pub async fn negotiate(&self, local: &[Candidate], remote: &[Candidate]) -> Result<SelectedPath> {
        let phases = form_pairs(local, remote);
        if phases.is_empty() {
            return Err(Error::NatTraversalFailed(
                "no compatible candidate pairs".to_string(),
            ));
        }

        let (direct, relay): (Vec<_>, Vec<_>) =
            phases.into_iter().partition(|(phase, _)| !phase.is_relay());

        let direct_stage = async {
            for (phase, pairs) in &direct {
                if let Some(found) = self.check_phase(*phase, pairs).await {
                    return Some(found);
                }
            }
            None
        };

        let direct_result = match tokio::time::timeout(self.config.gathering_timeout(), direct_stage).await {
            Ok(found) => found,
            Err(_) => {
                warn!(
                    "Direct candidates timed out after {:?}, falling back to relay",
                    self.config.gathering_timeout()
                );
                None
            }
        };
        if let Some((pair, rtt)) = direct_result {
            return Ok(self.selected(pair, rtt));
        }

        for (phase, pairs) in &relay {
            if let Some((pair, rtt)) = self.check_phase(*phase, pairs).await {
                return Ok(self.selected(pair, rtt));
            }
        }

        Err(Error::NatTraversalFailed(
            "every direct and relay candidate pair failed".to_string(),
        ))
    }

    async fn check_phase(
        &self,
        phase: CheckPhase,
        pairs: &[CandidatePair],
    ) -> Option<(CandidatePair, Duration)> {
        debug!("Checking {} pairs in phase {:?}", pairs.len(), phase);
        let checks = pairs.iter().map(|pair| async move {
            match tokio::time::timeout(self.config.check_timeout(), self.probe.check(pair)).await {
                Ok(Ok(rtt)) => Some((*pair, rtt)),
                Ok(Err(e)) => {
                    debug!("Check {:?} failed: {}", pair, e);
                    None
                }
                Err(_) => {
                    debug!("Check {:?} timed out", pair);
                    None
                }
            }
        });

        let successes: Vec<_> = join_all(checks).await.into_iter().flatten().collect();
        select_best(&successes)
    }

    fn selected(&self, pair: CandidatePair, rtt: Duration) -> SelectedPath {
        let path = SelectedPath {
            pair,
            rtt_ms: rtt.as_secs_f64() * 1000.0,
            is_relay: pair.is_relay(),
        };
        info!(
            "Selected {} path {} -> {} ({:.1}ms)",
            if path.is_relay { "relay" } else { "direct" },
            pair.local.address,
            pair.remote.address,
            path.rtt_ms
        );
        path
    }
}
