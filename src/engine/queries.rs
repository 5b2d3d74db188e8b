use ulid::Ulid;

use crate::model::*;

use super::conflict::check_no_conflict;
use super::slots::validate_day;
use super::{Engine, EngineError, SharedTutorState};

impl Engine {
    pub async fn get_lesson(&self, lesson_id: &Ulid) -> Option<Lesson> {
        let shared = self.get_tutor(&self.tutor_for_lesson(lesson_id)?)?;
        let guard = shared.read().await;
        guard.lesson(lesson_id).cloned()
    }

    /// Lessons of one tutor ordered by start, optionally limited to one date.
    pub async fn lessons_for_tutor(&self, tutor_id: Ulid, date: Option<Day>) -> Vec<Lesson> {
        let Some(shared) = self.get_tutor(&tutor_id) else {
            return Vec::new();
        };
        let guard = shared.read().await;
        guard
            .lessons
            .iter()
            .filter(|l| date.is_none_or(|d| l.date == d))
            .cloned()
            .collect()
    }

    pub async fn lessons_for_student(&self, student_id: Ulid) -> Vec<Lesson> {
        let mut lessons = self
            .collect_lessons(|l| l.student_id == student_id)
            .await;
        lessons.sort_by_key(|l| l.span.start);
        lessons
    }

    /// Snapshot of matching lessons across all tutors, one read lock at a time.
    pub(super) async fn collect_lessons(&self, keep: impl Fn(&Lesson) -> bool) -> Vec<Lesson> {
        let shared: Vec<SharedTutorState> = self.tutors.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for ts in shared {
            let guard = ts.read().await;
            out.extend(guard.lessons.iter().filter(|l| keep(l)).cloned());
        }
        out
    }

    /// Transition log for one lesson, oldest first.
    pub async fn status_history(&self, lesson_id: &Ulid) -> Vec<StatusHistoryEntry> {
        let Some(shared) = self
            .tutor_for_lesson(lesson_id)
            .and_then(|tid| self.get_tutor(&tid))
        else {
            return Vec::new();
        };
        let guard = shared.read().await;
        guard
            .history
            .iter()
            .filter(|h| h.lesson_id == *lesson_id)
            .cloned()
            .collect()
    }

    pub async fn slot(&self, tutor_id: Ulid, date: Day, hour: u8) -> Option<AvailabilitySlot> {
        let shared = self.get_tutor(&tutor_id)?;
        let guard = shared.read().await;
        guard.slots.get(&(date, hour)).copied()
    }

    /// True when a scheduled lesson of the tutor overlaps `[start, end)` on `date`.
    pub async fn has_conflict(&self, tutor_id: Ulid, date: Day, start: Ms, end: Ms) -> Result<bool, EngineError> {
        if start >= end {
            return Err(EngineError::InvalidRequest("start must be before end"));
        }
        let Some(shared) = self.get_tutor(&tutor_id) else {
            return Ok(false);
        };
        let guard = shared.read().await;
        match check_no_conflict(&guard, date, &Span::new(start, end)) {
            Ok(()) => Ok(false),
            Err(EngineError::SlotConflict(_)) => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Bookable hours of a tutor on `date`: open, unbooked, still ahead of `now`, and clear of any
    /// scheduled lesson.
    pub async fn available_time_slots(&self, tutor_id: Ulid, date: Day, now: Ms) -> Vec<TimeSlot> {
        if validate_day(date).is_err() {
            return Vec::new();
        }
        let Some(shared) = self.get_tutor(&tutor_id) else {
            return Vec::new();
        };
        let guard = shared.read().await;
        guard
            .slots
            .range((date, 0)..(date + 1, 0))
            .map(|(_, slot)| slot)
            .filter(|slot| slot.is_free())
            .map(|slot| slot.span())
            .filter(|span| span.start > now && check_no_conflict(&guard, date, span).is_ok())
            .map(|span| TimeSlot {
                start: span.start,
                end: span.end,
            })
            .collect()
    }
}
