use crate::model::*;

use super::EngineError;

/// A tutor may hold only one scheduled lesson over any instant. Cancelled, completed and other
/// settled lessons never block. Caller holds the tutor's lock, which is what makes check-then-insert
/// safe against a concurrent booking.
pub(crate) fn check_no_conflict(ts: &TutorState, date: Day, span: &Span) -> Result<(), EngineError> {
    // Fast path: same start time.
    let first = ts.lessons.partition_point(|l| l.span.start < span.start);
    if let Some(hit) = ts.lessons[first..]
        .iter()
        .take_while(|l| l.span.start == span.start)
        .find(|l| l.date == date && l.status == LessonStatus::Scheduled)
    {
        return Err(EngineError::SlotConflict(hit.id));
    }

    // Existing [s, e) against new [S, E): conflict iff s < E && e > S. Touching ends are fine.
    match ts
        .overlapping(date, span)
        .find(|l| l.status == LessonStatus::Scheduled)
    {
        Some(hit) => Err(EngineError::SlotConflict(hit.id)),
        None => Ok(()),
    }
}
