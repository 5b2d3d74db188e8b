use std::time::Instant;

use tracing::{debug, warn};
use ulid::Ulid;

use crate::model::*;
use crate::ports::MeetingProvider;

use super::status::MeetingStamps;
use super::{Engine, EngineError};

#[derive(Debug)]
pub struct SweepFailure {
    pub lesson_id: Ulid,
    pub error: EngineError,
}

/// Outcome of one sweep pass. `processed` counts lessons the sweep acted on, failed ones
/// included; `completed` those whose status it changed. Failures never stop the pass.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub processed: usize,
    pub completed: usize,
    pub errors: Vec<SweepFailure>,
}

impl SweepReport {
    fn fail(&mut self, sweep: &'static str, lesson_id: Ulid, error: EngineError) {
        warn!("{sweep} sweep: lesson {lesson_id}: {error:?}");
        metrics::counter!(crate::observability::SWEEP_LESSONS_TOTAL, "sweep" => sweep, "outcome" => "error")
            .increment(1);
        self.errors.push(SweepFailure { lesson_id, error });
    }

    fn record(&mut self, sweep: &'static str, outcome: Result<Option<Lesson>, EngineError>, lesson_id: Ulid) -> bool {
        match outcome {
            Ok(Some(_)) => {
                self.processed += 1;
                self.completed += 1;
                metrics::counter!(crate::observability::SWEEP_LESSONS_TOTAL, "sweep" => sweep, "outcome" => "transitioned")
                    .increment(1);
                true
            }
            // Moved on between scan and lock.
            Ok(None) => false,
            Err(e) => {
                self.processed += 1;
                self.fail(sweep, lesson_id, e);
                false
            }
        }
    }
}

fn observe(sweep: &'static str, started: Instant) {
    metrics::histogram!(crate::observability::SWEEP_DURATION_SECONDS, "sweep" => sweep)
        .record(started.elapsed().as_secs_f64());
}

impl Engine {
    /// Scheduled lessons nobody started within the grace period become `not_started`.
    pub async fn run_not_started_sweep(&self, now: Ms) -> SweepReport {
        const SWEEP: &str = "not_started";
        let started = Instant::now();
        let grace = self.config.not_started_grace_ms;
        let due = self
            .collect_lessons(|l| l.status == LessonStatus::Scheduled && l.span.start + grace < now)
            .await;
        let reason = format!(
            "Lesson was not started within {} minutes of its scheduled start",
            grace / MINUTE_MS
        );

        let mut report = SweepReport::default();
        for lesson in due {
            let outcome = self
                .system_transition(
                    lesson.id,
                    LessonStatus::Scheduled,
                    LessonStatus::NotStarted,
                    reason.clone(),
                    now,
                    MeetingStamps::default(),
                )
                .await;
            report.record(SWEEP, outcome, lesson.id);
        }
        observe(SWEEP, started);
        report
    }

    /// In-progress lessons whose room has been empty for `threshold_minutes` are completed and
    /// their room is removed.
    pub async fn run_empty_room_sweep(
        &self,
        provider: &dyn MeetingProvider,
        threshold_minutes: u32,
        now: Ms,
    ) -> SweepReport {
        const SWEEP: &str = "empty_room";
        let started = Instant::now();
        let threshold = threshold_minutes as Ms * MINUTE_MS;
        let live = self
            .collect_lessons(|l| {
                l.status == LessonStatus::InProgress
                    && l.meeting_room_name.is_some()
                    && provider.has_meeting_room(l)
            })
            .await;

        let mut report = SweepReport::default();
        for lesson in live {
            let Some(room) = lesson.meeting_room_name.as_deref() else {
                continue;
            };
            let empty_for = match provider.room_empty_for(room).await {
                Ok(ms) => ms,
                Err(e) => {
                    report.processed += 1;
                    report.fail(SWEEP, lesson.id, e);
                    continue;
                }
            };
            if empty_for < threshold {
                continue;
            }
            let stamps = MeetingStamps {
                ended_at: Some(now),
                close_sessions: true,
                ..MeetingStamps::default()
            };
            let reason = format!("Meeting room empty for {threshold_minutes} minutes");
            let outcome = self
                .system_transition(lesson.id, LessonStatus::InProgress, LessonStatus::Completed, reason, now, stamps)
                .await;
            if report.record(SWEEP, outcome, lesson.id) {
                self.remove_room(provider, SWEEP, lesson.id, room, &mut report).await;
            }
        }
        observe(SWEEP, started);
        report
    }

    /// In-progress lessons running past the meeting ceiling are force-completed, their open
    /// sessions closed and their room removed.
    pub async fn run_timeout_sweep(&self, provider: &dyn MeetingProvider, now: Ms) -> SweepReport {
        const SWEEP: &str = "timeout";
        let started = Instant::now();
        let ceiling = self.config.max_meeting_duration_ms;
        let overdue = self
            .collect_lessons(|l| {
                l.status == LessonStatus::InProgress
                    && l.meeting_started_at.unwrap_or(l.span.start) + ceiling < now
            })
            .await;
        let reason = format!("Meeting exceeded {} minutes", ceiling / MINUTE_MS);

        let mut report = SweepReport::default();
        for lesson in overdue {
            let stamps = MeetingStamps {
                ended_at: Some(now),
                close_sessions: true,
                ..MeetingStamps::default()
            };
            let outcome = self
                .system_transition(
                    lesson.id,
                    LessonStatus::InProgress,
                    LessonStatus::Completed,
                    reason.clone(),
                    now,
                    stamps,
                )
                .await;
            if report.record(SWEEP, outcome, lesson.id)
                && let Some(room) = lesson.meeting_room_name.as_deref()
                && provider.has_meeting_room(&lesson)
            {
                self.remove_room(provider, SWEEP, lesson.id, room, &mut report).await;
            }
        }
        observe(SWEEP, started);
        report
    }

    /// Best-effort: the status change is already committed and stays that way if this fails.
    async fn remove_room(
        &self,
        provider: &dyn MeetingProvider,
        sweep: &'static str,
        lesson_id: Ulid,
        room: &str,
        report: &mut SweepReport,
    ) {
        match provider.delete_room(room).await {
            Ok(true) => debug!("deleted room {room} for lesson {lesson_id}"),
            Ok(false) => debug!("room {room} for lesson {lesson_id} was already gone"),
            Err(e) => report.fail(sweep, lesson_id, e),
        }
    }
}
