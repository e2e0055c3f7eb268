//! Shared fixtures: two devices on one in-process relay hub

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use remotedesk_core::credentials::RelayCredential;
use remotedesk_core::peer::{Candidate, CandidateKind, CandidatePair};
use remotedesk_core::signaling::SignalingHub;
use remotedesk_core::{
    Clock, ConnectivityProbe, CredentialIssuer, EngineConfig, Endpoint, EndpointParts, Error,
    EventBus, ManualClock, MemoryHistory, PlatformTag, Result,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// ICE agent stand-in with fixed candidates
///
/// Relayed pairs always pass; direct pairs pass only while `direct_ok`.
pub struct ScriptedProbe {
    pub candidates: Vec<Candidate>,
    pub direct_ok: AtomicBool,
    pub checked: Mutex<Vec<CandidatePair>>,
    pub relay_offered: AtomicBool,
}

impl ScriptedProbe {
    pub fn new(candidates: Vec<Candidate>) -> Arc<Self> {
        Arc::new(Self {
            candidates,
            direct_ok: AtomicBool::new(true),
            checked: Mutex::new(Vec::new()),
            relay_offered: AtomicBool::new(false),
        })
    }

    pub fn checked(&self) -> Vec<CandidatePair> {
        self.checked.lock().clone()
    }
}

#[async_trait]
impl ConnectivityProbe for ScriptedProbe {
    async fn local_candidates(&self, relay: Option<&RelayCredential>) -> Result<Vec<Candidate>> {
        self.relay_offered.store(relay.is_some(), Ordering::SeqCst);
        Ok(self.candidates.clone())
    }

    async fn check(&self, pair: &CandidatePair) -> Result<Duration> {
        self.checked.lock().push(*pair);
        if pair.is_relay() {
            Ok(Duration::from_millis(30))
        } else if self.direct_ok.load(Ordering::SeqCst) {
            Ok(Duration::from_millis(8))
        } else {
            Err(Error::NetworkUnreachable(pair.remote.address.to_string()))
        }
    }
}

pub fn candidate(kind: CandidateKind, addr: &str) -> Candidate {
    Candidate::new(kind, addr.parse().unwrap())
}

/// Host candidates on both families plus one IPv4 relay candidate
pub fn dual_stack(host: u8) -> Vec<Candidate> {
    vec![
        candidate(CandidateKind::Host, &format!("192.0.2.{}:5000", host)),
        candidate(CandidateKind::Relay, &format!("203.0.113.{}:3478", host)),
        candidate(CandidateKind::Host, &format!("[2001:db8::{}]:5000", host)),
    ]
}

/// Relay hub, credential issuer and clock shared by every device in a test
pub struct TestNet {
    pub hub: Arc<SignalingHub>,
    pub issuer: Arc<CredentialIssuer>,
    pub clock: Arc<ManualClock>,
    pub config: EngineConfig,
}

impl TestNet {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut config = EngineConfig::default();
        config.signaling.handshake_timeout_ms = 2000;
        config.ice.turn_shared_secret = Some("relay-secret".to_string());
        Self {
            hub: Arc::new(SignalingHub::new(chrono::Duration::seconds(45), clock.clone())),
            issuer: Arc::new(CredentialIssuer::new(config.credentials.clone(), clock.clone())),
            clock,
            config,
        }
    }

    pub async fn device(&self, name: &str, probe: Arc<ScriptedProbe>) -> Device {
        let identity = self.issuer.register_device(PlatformTag::Linux).unwrap();
        let credential = self.issuer.new_credential();
        let events = EventBus::default();
        let parts = EndpointParts {
            config: self.config.clone(),
            identity,
            credential,
            device_name: name.to_string(),
            issuer: Arc::clone(&self.issuer),
            probe: probe.clone(),
            history: Arc::new(MemoryHistory::new()),
            clock: self.clock.clone() as Arc<dyn Clock>,
            events,
            notifier: None,
            input: None,
            capture: None,
        };
        let endpoint = Endpoint::open(parts, self.hub.attach()).await.unwrap();
        Device { endpoint, probe }
    }
}

pub struct Device {
    pub endpoint: Arc<Endpoint>,
    pub probe: Arc<ScriptedProbe>,
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
