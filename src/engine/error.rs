use ulid::Ulid;

use crate::model::{Ms, ReservationStatus};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    InvalidTransition {
        from: ReservationStatus,
        to: ReservationStatus,
    },
    NotAuthorized(String),
    SlotFull {
        space_id: Ulid,
        start: Ms,
    },
    DuplicateFeedback {
        program_id: Ulid,
        user_id: String,
    },
    SpaceInUse(Ulid),
    NotReschedulable(ReservationStatus),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "invalid transition: {} -> {}", from.as_str(), to.as_str())
            }
            EngineError::NotAuthorized(actor) => write!(f, "not authorized: {actor}"),
            EngineError::SlotFull { space_id, start } => {
                write!(f, "slot full: space {space_id} at {start}")
            }
            EngineError::DuplicateFeedback { program_id, user_id } => {
                write!(f, "feedback already submitted for {program_id} by {user_id}")
            }
            EngineError::SpaceInUse(id) => {
                write!(f, "cannot delete space {id}: active reservations or waitlist")
            }
            EngineError::NotReschedulable(status) => {
                write!(f, "cannot reschedule a {} reservation", status.as_str())
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
