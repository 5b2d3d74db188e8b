use ulid::Ulid;

use crate::model::{Day, LessonStatus};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    /// Student has no active, unexpired package with hours left.
    NoActivePackage(Ulid),
    InsufficientHours {
        needed: u32,
        remaining: u32,
    },
    TutorUnavailable {
        tutor_id: Ulid,
        date: Day,
        hour: u8,
    },
    /// Overlaps the scheduled lesson with this id.
    SlotConflict(Ulid),
    AlreadyBooked {
        date: Day,
        hour: u8,
    },
    Forbidden(&'static str),
    InvalidStatus(String),
    InvalidTransition {
        from: LessonStatus,
        to: LessonStatus,
    },
    AlreadyTerminal(LessonStatus),
    InvalidRequest(&'static str),
    LimitExceeded(&'static str),
    ProviderUnavailable(String),
    JournalError(String),
}

impl EngineError {
    /// Short static label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::NoActivePackage(_) => "no_active_package",
            EngineError::InsufficientHours { .. } => "insufficient_hours",
            EngineError::TutorUnavailable { .. } => "tutor_unavailable",
            EngineError::SlotConflict(_) => "slot_conflict",
            EngineError::AlreadyBooked { .. } => "already_booked",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::InvalidStatus(_) => "invalid_status",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::AlreadyTerminal(_) => "already_terminal",
            EngineError::InvalidRequest(_) => "invalid_request",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::ProviderUnavailable(_) => "provider_unavailable",
            EngineError::JournalError(_) => "journal_error",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::NoActivePackage(student) => {
                write!(f, "student {student} has no active package with hours remaining")
            }
            EngineError::InsufficientHours { needed, remaining } => {
                write!(f, "lesson needs {needed} package hours, {remaining} remaining")
            }
            EngineError::TutorUnavailable { tutor_id, date, hour } => {
                write!(f, "tutor {tutor_id} is not available on day {date} at {hour:02}:00")
            }
            EngineError::SlotConflict(id) => {
                write!(f, "time range overlaps scheduled lesson {id}")
            }
            EngineError::AlreadyBooked { date, hour } => {
                write!(f, "slot on day {date} at {hour:02}:00 is already booked")
            }
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::InvalidStatus(s) => write!(f, "invalid lesson status: {s:?}"),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "cannot move a lesson from {from} to {to}")
            }
            EngineError::AlreadyTerminal(status) => {
                write!(f, "lesson is already {status} and cannot change")
            }
            EngineError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            // Internal detail stays in the variant for logs.
            EngineError::ProviderUnavailable(_) => write!(f, "meeting provider unavailable"),
            EngineError::JournalError(_) => write!(f, "internal storage error"),
        }
    }
}

impl std::error::Error for EngineError {}
