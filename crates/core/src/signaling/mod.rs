//! Signaling: envelopes, transports, the device channel and the relay hub

pub mod channel;
pub mod hub;
pub mod protocol;
pub mod transport;

pub use channel::{SessionSignals, SignalingChannel};
pub use hub::{HubTransport, SignalingHub};
pub use protocol::{
    ConnectRequestPayload, ConnectResponsePayload, DisconnectPayload, IceCandidatePayload,
    MessageType, RegisterPayload, SessionDescriptionPayload, SignalingMessage, RELAY_DEVICE_ID,
};
pub use transport::{
    connect_with_failover, SignalingConnector, SignalingTransport, WebSocketConnector,
    WebSocketTransport,
};
