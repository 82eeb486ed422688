//! Chat domain: transcript types, per-session state, and the turn controller.

pub mod message;
pub mod session;
pub mod turn;

pub use message::{Content, HistoryRole, Message, Role, mirror_history};
pub use session::{
    SessionDefaults, SessionError, SessionHandle, SessionId, SessionSnapshot, SessionState,
    SessionStore, TurnPhase,
};
pub use turn::{ReplyAccumulator, TurnController, TurnError, TurnEvent, TurnOutcome};
