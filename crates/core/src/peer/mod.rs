//! Peer connections: candidates, negotiation and the connection state machine

pub mod candidate;
pub mod connection;
pub mod negotiator;

pub use candidate::{form_pairs, AddressFamily, Candidate, CandidateKind, CandidatePair, CheckPhase};
pub use connection::{
    ConnectionDeps, ConnectionEvent, ConnectionState, ConnectionStateMachine, FailureReason,
    PathKind, PeerConnection,
};
pub use negotiator::{select_best, CandidateNegotiator, ConnectivityProbe, SelectedPath};
