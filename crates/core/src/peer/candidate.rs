//! ICE-style candidates and pairs

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

/// How a candidate address was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateKind {
    /// Local interface address
    Host,
    /// Public address learned through STUN
    ServerReflexive,
    /// Address allocated on a TURN relay
    Relay,
}

/// IP family of a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressFamily {
    V6,
    V4,
}

/// Transport address offered by one side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub kind: CandidateKind,
    pub address: SocketAddr,
}

impl Candidate {
    pub fn new(kind: CandidateKind, address: SocketAddr) -> Self {
        Self { kind, address }
    }

    pub fn family(&self) -> AddressFamily {
        match self.address.ip() {
            IpAddr::V6(_) => AddressFamily::V6,
            IpAddr::V4(_) => AddressFamily::V4,
        }
    }

    pub fn is_relay(&self) -> bool {
        self.kind == CandidateKind::Relay
    }

    /// Whether the address can carry traffic at all
    ///
    /// Unspecified addresses never can; IPv6 link-local (fe80::/10) is not
    /// treated as a usable IPv6 path.
    pub fn is_usable(&self) -> bool {
        match self.address.ip() {
            IpAddr::V4(v4) => !v4.is_unspecified(),
            IpAddr::V6(v6) => {
                !v6.is_unspecified() && (v6.segments()[0] & 0xffc0) != 0xfe80
            }
        }
    }
}

/// Order in which candidate pairs are tried
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckPhase {
    DirectV6,
    DirectV4,
    RelayV6,
    RelayV4,
}

impl CheckPhase {
    /// All phases in check order
    pub const ORDER: [CheckPhase; 4] = [
        CheckPhase::DirectV6,
        CheckPhase::DirectV4,
        CheckPhase::RelayV6,
        CheckPhase::RelayV4,
    ];

    pub fn is_relay(self) -> bool {
        matches!(self, CheckPhase::RelayV6 | CheckPhase::RelayV4)
    }
}

/// Local/remote candidate pair of the same family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePair {
    pub local: Candidate,
    pub remote: Candidate,
}

impl CandidatePair {
    /// Pair two candidates; `None` when families differ or either is unusable
    pub fn new(local: Candidate, remote: Candidate) -> Option<Self> {
        if local.family() != remote.family() || !local.is_usable() || !remote.is_usable() {
            return None;
        }
        Some(Self { local, remote })
    }

    /// A pair is relayed when either end is a relay candidate
    pub fn is_relay(&self) -> bool {
        self.local.is_relay() || self.remote.is_relay()
    }

    pub fn family(&self) -> AddressFamily {
        self.local.family()
    }

    pub fn phase(&self) -> CheckPhase {
        match (self.is_relay(), self.family()) {
            (false, AddressFamily::V6) => CheckPhase::DirectV6,
            (false, AddressFamily::V4) => CheckPhase::DirectV4,
            (true, AddressFamily::V6) => CheckPhase::RelayV6,
            (true, AddressFamily::V4) => CheckPhase::RelayV4,
        }
    }
}

/// Every usable same-family pair, grouped by phase in check order
pub fn form_pairs(local: &[Candidate], remote: &[Candidate]) -> Vec<(CheckPhase, Vec<CandidatePair>)> {
    let mut pairs: Vec<CandidatePair> = Vec::new();
    for l in local {
        for r in remote {
            if let Some(pair) = CandidatePair::new(*l, *r) {
                if !pairs.contains(&pair) {
                    pairs.push(pair);
                }
            }
        }
    }

    CheckPhase::ORDER
        .iter()
        .map(|phase| {
            let group: Vec<_> = pairs.iter().copied().filter(|p| p.phase() == *phase).collect();
            (*phase, group)
        })
        .filter(|(_, group)| !group.is_empty())
        .collect()
}
