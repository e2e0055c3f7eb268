//! Remote-control sessions: lifecycle, statistics and history

pub mod history;
pub mod manager;
pub mod session;

pub use history::{HistoryStore, JsonFileHistory, MemoryHistory};
pub use manager::{QualitySummary, SessionManager, StatsSource};
pub use session::{
    EndReason, Session, SessionEvent, SessionEventKind, SessionId, SessionOptions,
    SessionPermissions, SessionRecord, SessionRole, SessionStats, SessionStatus, StatsUpdate,
};
