use tracing::{debug, error, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::check_no_conflict;
use super::slots::{find_free_slots, validate_day};
use super::{Engine, EngineError};

/// Shape checks that need no state: positive bounded duration, future start, single calendar day.
fn validate_request(request: &BookingRequest, now: Ms) -> Result<(Day, Span), EngineError> {
    if request.duration_minutes == 0 {
        return Err(EngineError::InvalidRequest("lesson duration must be positive"));
    }
    if request.duration_minutes > MAX_LESSON_DURATION_MINUTES {
        return Err(EngineError::LimitExceeded("lesson too long"));
    }
    if request.start <= now {
        return Err(EngineError::InvalidRequest("lesson must start in the future"));
    }
    let end = (request.duration_minutes as Ms)
        .checked_mul(MINUTE_MS)
        .and_then(|length| request.start.checked_add(length))
        .ok_or(EngineError::InvalidRequest("lesson start out of range"))?;
    let span = Span::new(request.start, end);
    let date = day_of(span.start);
    validate_day(date)?;
    if day_of(span.end - 1) != date {
        return Err(EngineError::InvalidRequest("lesson must not cross midnight"));
    }
    Ok((date, span))
}

impl Engine {
    /// Book a lesson: lesson row, slot hours and package hours move together or not at all.
    pub async fn book_lesson(&self, request: BookingRequest, now: Ms) -> Result<Lesson, EngineError> {
        let result = self.try_book(&request, now).await;
        match &result {
            Ok(lesson) => {
                metrics::counter!(crate::observability::LESSONS_BOOKED_TOTAL).increment(1);
                info!(
                    "booked lesson {} for student {} with tutor {} on day {}",
                    lesson.id, lesson.student_id, lesson.tutor_id, lesson.date
                );
            }
            Err(e) => {
                metrics::counter!(crate::observability::BOOKINGS_REJECTED_TOTAL, "reason" => e.kind())
                    .increment(1);
                debug!("booking rejected for student {}: {e}", request.student_id);
            }
        }
        result
    }

    async fn try_book(&self, request: &BookingRequest, now: Ms) -> Result<Lesson, EngineError> {
        let (date, span) = validate_request(request, now)?;
        let shared = self
            .get_tutor(&request.tutor_id)
            .ok_or(EngineError::NotFound(request.tutor_id))?;

        // Critical section: everything from the conflict check to the apply runs under the tutor lock.
        let mut guard = shared.write().await;
        if guard.lessons.len() >= MAX_LESSONS_PER_TUTOR {
            return Err(EngineError::LimitExceeded("too many lessons for tutor"));
        }
        check_no_conflict(&guard, date, &span)?;
        let slot_hours = find_free_slots(&guard, date, span.covered_hours(date))?;

        let charge = hours_for_duration(request.duration_minutes);
        let balance = self
            .balances
            .active_balance(request.student_id, charge, now)
            .await?;
        self.balances.decrement_hours(balance.id, charge).await?;

        let lesson = Lesson {
            id: Ulid::new(),
            student_id: request.student_id,
            tutor_id: request.tutor_id,
            package_assignment_id: balance.id,
            date,
            span,
            duration_minutes: request.duration_minutes,
            slot_hours,
            price: guard.hourly_rate,
            hours_charged: charge,
            hours_refunded: 0,
            slots_released: false,
            status: LessonStatus::Scheduled,
            status_reason: None,
            status_updated_by: None,
            status_updated_at: None,
            cancelled_at: None,
            cancelled_by: None,
            meeting_room_name: None,
            meeting_started_at: None,
            meeting_ended_at: None,
            sessions: Vec::new(),
            created_at: now,
        };

        let event = Event::LessonBooked { lesson: lesson.clone() };
        if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
            if let Err(undo) = self.balances.increment_hours(balance.id, charge).await {
                error!(
                    "failed to return {charge} hours to balance {} after aborted booking: {undo:?}",
                    balance.id
                );
            }
            return Err(e);
        }
        Ok(lesson)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: Ms = 20157 * DAY_MS;

    fn request(start: Ms, duration_minutes: u32) -> BookingRequest {
        BookingRequest {
            student_id: Ulid::new(),
            tutor_id: Ulid::new(),
            start,
            duration_minutes,
        }
    }

    #[test]
    fn rejects_bad_shapes() {
        assert!(matches!(
            validate_request(&request(NOW + HOUR_MS, 0), NOW),
            Err(EngineError::InvalidRequest(_))
        ));
        assert!(matches!(
            validate_request(&request(NOW + HOUR_MS, MAX_LESSON_DURATION_MINUTES + 1), NOW),
            Err(EngineError::LimitExceeded(_))
        ));
        assert!(matches!(
            validate_request(&request(NOW, 60), NOW),
            Err(EngineError::InvalidRequest("lesson must start in the future"))
        ));
        assert!(matches!(
            validate_request(&request(NOW + 23 * HOUR_MS, 90), NOW),
            Err(EngineError::InvalidRequest("lesson must not cross midnight"))
        ));
    }

    #[test]
    fn rejects_starts_beyond_the_calendar() {
        assert!(matches!(
            validate_request(&request(i64::MAX - 1_000, 60), NOW),
            Err(EngineError::InvalidRequest("lesson start out of range"))
        ));
        assert!(matches!(
            validate_request(&request((MAX_DAY + 1) * DAY_MS, 60), NOW),
            Err(EngineError::InvalidRequest("date out of range"))
        ));
    }

    #[test]
    fn lesson_ending_at_midnight_is_same_day() {
        let (date, span) = validate_request(&request(NOW + 23 * HOUR_MS, 60), NOW).unwrap();
        assert_eq!(date, 20157);
        assert_eq!(span.covered_hours(date), 23..24);
    }
}
