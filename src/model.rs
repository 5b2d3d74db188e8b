use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;

/// Unix milliseconds, the only instant type.
pub type Ms = i64;

/// Calendar date as days since the Unix epoch (UTC).
pub type Day = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 3_600_000;
pub const DAY_MS: Ms = 86_400_000;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as Ms)
}

pub fn day_of(t: Ms) -> Day {
    t.div_euclid(DAY_MS)
}

/// Start instant of `hour` on `date`.
pub fn hour_start(date: Day, hour: u8) -> Ms {
    date * DAY_MS + hour as Ms * HOUR_MS
}

/// Package hours consumed by a lesson: one per started hour, never fractional.
pub fn hours_for_duration(duration_minutes: u32) -> u32 {
    duration_minutes.div_ceil(60)
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Hours of the day touched by this span, assuming it lies within `date`.
    pub fn covered_hours(&self, date: Day) -> std::ops::Range<u8> {
        let base = date * DAY_MS;
        let first = (self.start - base).div_euclid(HOUR_MS);
        let last = (self.end - base + HOUR_MS - 1).div_euclid(HOUR_MS);
        (first.clamp(0, 24) as u8)..(last.clamp(0, 24) as u8)
    }
}

// ── Actors ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Admin,
    Moderator,
    Tutor,
    Student,
    /// Unattended jobs (sweeps).
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Moderator => "moderator",
            Role::Tutor => "tutor",
            Role::Student => "student",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who is asking. Threaded explicitly through every mutating call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Ulid,
    pub role: Role,
}

impl Actor {
    pub fn new(id: Ulid, role: Role) -> Self {
        Self { id, role }
    }

    pub const fn system() -> Self {
        Self {
            id: Ulid::nil(),
            role: Role::System,
        }
    }

    pub fn tutor(id: Ulid) -> Self {
        Self::new(id, Role::Tutor)
    }

    pub fn student(id: Ulid) -> Self {
        Self::new(id, Role::Student)
    }

    pub fn admin(id: Ulid) -> Self {
        Self::new(id, Role::Admin)
    }
}

// ── Lesson status ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LessonStatus {
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
    NoShowStudent,
    NoShowTutor,
    TechnicalIssues,
    NotStarted,
}

impl LessonStatus {
    pub const ALL: [LessonStatus; 8] = [
        LessonStatus::Scheduled,
        LessonStatus::InProgress,
        LessonStatus::Completed,
        LessonStatus::Cancelled,
        LessonStatus::NoShowStudent,
        LessonStatus::NoShowTutor,
        LessonStatus::TechnicalIssues,
        LessonStatus::NotStarted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LessonStatus::Scheduled => "scheduled",
            LessonStatus::InProgress => "in_progress",
            LessonStatus::Completed => "completed",
            LessonStatus::Cancelled => "cancelled",
            LessonStatus::NoShowStudent => "no_show_student",
            LessonStatus::NoShowTutor => "no_show_tutor",
            LessonStatus::TechnicalIssues => "technical_issues",
            LessonStatus::NotStarted => "not_started",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, LessonStatus::Scheduled | LessonStatus::InProgress)
    }
}

impl fmt::Display for LessonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LessonStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LessonStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| EngineError::InvalidStatus(s.to_string()))
    }
}

// ── Records ──────────────────────────────────────────────────────

/// One bookable tutor-hour. Capacity is always one lesson.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilitySlot {
    pub date: Day,
    pub start_hour: u8,
    pub is_available: bool,
    /// 0 or 1.
    pub hours_booked: u8,
}

impl AvailabilitySlot {
    pub const CAPACITY: u8 = 1;

    pub fn new(date: Day, start_hour: u8) -> Self {
        Self {
            date,
            start_hour,
            is_available: true,
            hours_booked: 0,
        }
    }

    pub fn end_hour(&self) -> u8 {
        self.start_hour + 1
    }

    pub fn span(&self) -> Span {
        Span::new(
            hour_start(self.date, self.start_hour),
            hour_start(self.date, self.start_hour) + HOUR_MS,
        )
    }

    pub fn is_free(&self) -> bool {
        self.is_available && self.hours_booked == 0
    }
}

/// A student's purchased pool of hours. Owned by billing; the engine only moves hours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageBalance {
    pub id: Ulid,
    pub student_id: Ulid,
    pub hours_remaining: u32,
    pub is_active: bool,
    pub expires_at: Ms,
}

impl PackageBalance {
    pub fn is_bookable(&self, now: Ms) -> bool {
        self.is_active && self.hours_remaining > 0 && self.expires_at > now
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeetingSession {
    pub participant_id: Ulid,
    pub role: Role,
    pub joined_at: Ms,
    pub left_at: Option<Ms>,
}

impl MeetingSession {
    pub fn is_open(&self) -> bool {
        self.left_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lesson {
    pub id: Ulid,
    pub student_id: Ulid,
    pub tutor_id: Ulid,
    pub package_assignment_id: Ulid,
    pub date: Day,
    pub span: Span,
    pub duration_minutes: u32,
    /// Slot hours on `date` consumed by this lesson.
    pub slot_hours: Vec<u8>,
    /// Tutor's hourly rate at booking time.
    pub price: u64,
    pub hours_charged: u32,
    pub hours_refunded: u32,
    pub slots_released: bool,
    pub status: LessonStatus,
    pub status_reason: Option<String>,
    pub status_updated_by: Option<Ulid>,
    pub status_updated_at: Option<Ms>,
    pub cancelled_at: Option<Ms>,
    pub cancelled_by: Option<Role>,
    pub meeting_room_name: Option<String>,
    pub meeting_started_at: Option<Ms>,
    pub meeting_ended_at: Option<Ms>,
    pub sessions: Vec<MeetingSession>,
    pub created_at: Ms,
}

impl Lesson {
    pub fn open_session(&self, participant_id: Ulid) -> Option<&MeetingSession> {
        self.sessions
            .iter()
            .find(|s| s.participant_id == participant_id && s.is_open())
    }
}

/// Write-once audit row, one per applied transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub lesson_id: Ulid,
    pub status: LessonStatus,
    pub previous_status: LessonStatus,
    pub reason: Option<String>,
    pub changed_by_role: Role,
    pub changed_by_user_id: Ulid,
    pub at: Ms,
}

/// Everything a status write carries, including its side effects, so replay is exact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub lesson_id: Ulid,
    pub tutor_id: Ulid,
    pub from: LessonStatus,
    pub to: LessonStatus,
    pub reason: Option<String>,
    pub actor_id: Ulid,
    pub actor_role: Role,
    pub at: Ms,
    pub stamp_cancellation: bool,
    pub released_hours: Vec<u8>,
    pub refunded_hours: u32,
    pub rebooked_hours: Vec<u8>,
    pub recharged_hours: u32,
    pub meeting_room_name: Option<String>,
    pub meeting_started_at: Option<Ms>,
    pub meeting_ended_at: Option<Ms>,
    pub close_sessions: bool,
}

// ── Per-tutor state ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TutorState {
    pub id: Ulid,
    pub hourly_rate: u64,
    pub slots: BTreeMap<(Day, u8), AvailabilitySlot>,
    /// Sorted by `span.start`.
    pub lessons: Vec<Lesson>,
    pub history: Vec<StatusHistoryEntry>,
}

impl TutorState {
    pub fn new(id: Ulid, hourly_rate: u64) -> Self {
        Self {
            id,
            hourly_rate,
            slots: BTreeMap::new(),
            lessons: Vec::new(),
            history: Vec::new(),
        }
    }

    pub fn insert_lesson(&mut self, lesson: Lesson) {
        let pos = self
            .lessons
            .partition_point(|l| l.span.start <= lesson.span.start);
        self.lessons.insert(pos, lesson);
    }

    pub fn lesson(&self, id: &Ulid) -> Option<&Lesson> {
        self.lessons.iter().find(|l| l.id == *id)
    }

    pub fn lesson_mut(&mut self, id: &Ulid) -> Option<&mut Lesson> {
        self.lessons.iter_mut().find(|l| l.id == *id)
    }

    /// Lessons on `date` whose span overlaps `query`, any status.
    pub fn overlapping<'a>(&'a self, date: Day, query: &'a Span) -> impl Iterator<Item = &'a Lesson> {
        let right_bound = self.lessons.partition_point(|l| l.span.start < query.end);
        self.lessons[..right_bound]
            .iter()
            .filter(move |l| l.date == date && l.span.end > query.start)
    }
}

/// The journal record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    TutorRegistered {
        id: Ulid,
        hourly_rate: u64,
    },
    HourlyRateChanged {
        id: Ulid,
        hourly_rate: u64,
    },
    SlotsPublished {
        tutor_id: Ulid,
        date: Day,
        hours: Vec<u8>,
    },
    SlotsWithdrawn {
        tutor_id: Ulid,
        date: Day,
        hours: Vec<u8>,
    },
    LessonBooked {
        lesson: Lesson,
    },
    StatusChanged {
        change: StatusChange,
    },
    SessionOpened {
        lesson_id: Ulid,
        tutor_id: Ulid,
        participant_id: Ulid,
        role: Role,
        at: Ms,
    },
    SessionClosed {
        lesson_id: Ulid,
        tutor_id: Ulid,
        participant_id: Ulid,
        at: Ms,
    },
    /// Compaction snapshot of a slot, booked count included.
    SlotRestored {
        tutor_id: Ulid,
        slot: AvailabilitySlot,
    },
    /// Compaction snapshot of a lesson and its history; does not touch slots.
    LessonRestored {
        lesson: Lesson,
        history: Vec<StatusHistoryEntry>,
    },
}

impl Event {
    pub fn tutor_id(&self) -> Ulid {
        match self {
            Event::TutorRegistered { id, .. } | Event::HourlyRateChanged { id, .. } => *id,
            Event::SlotsPublished { tutor_id, .. }
            | Event::SlotsWithdrawn { tutor_id, .. }
            | Event::SessionOpened { tutor_id, .. }
            | Event::SessionClosed { tutor_id, .. }
            | Event::SlotRestored { tutor_id, .. } => *tutor_id,
            Event::LessonBooked { lesson } | Event::LessonRestored { lesson, .. } => lesson.tutor_id,
            Event::StatusChanged { change } => change.tutor_id,
        }
    }
}

// ── Requests & query results ─────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub student_id: Ulid,
    pub tutor_id: Ulid,
    pub start: Ms,
    pub duration_minutes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSlot {
    pub start: Ms,
    pub end: Ms,
}
