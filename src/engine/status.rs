use tracing::{error, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::check_no_conflict;
use super::policy::{authorize, plan_effects};
use super::slots::find_free_slots;
use super::{Engine, EngineError};

/// Meeting fields written in the same journal record as a status change.
#[derive(Debug, Clone, Default)]
pub(super) struct MeetingStamps {
    pub room_name: Option<String>,
    pub started_at: Option<Ms>,
    pub ended_at: Option<Ms>,
    pub close_sessions: bool,
}

fn validate_reason(reason: Option<&str>) -> Result<(), EngineError> {
    if reason.is_some_and(|r| r.len() > MAX_REASON_LEN) {
        return Err(EngineError::LimitExceeded("reason too long"));
    }
    Ok(())
}

fn is_participant(lesson: &Lesson, actor: &Actor) -> bool {
    match actor.role {
        Role::Tutor => lesson.tutor_id == actor.id,
        Role::Student => lesson.student_id == actor.id,
        Role::Admin | Role::Moderator => true,
        Role::System => false,
    }
}

impl Engine {
    pub async fn transition_status(
        &self,
        lesson_id: Ulid,
        actor: Actor,
        to: LessonStatus,
        reason: Option<String>,
        now: Ms,
    ) -> Result<Lesson, EngineError> {
        validate_reason(reason.as_deref())?;
        let mut guard = self.resolve_lesson_write(&lesson_id).await?;
        let lesson = guard
            .lesson(&lesson_id)
            .ok_or(EngineError::NotFound(lesson_id))?;
        authorize(lesson, &actor, to, reason.as_deref(), now)?;
        self.commit_transition(&mut guard, lesson_id, actor, to, reason, now, MeetingStamps::default())
            .await
    }

    /// Same as `transition_status`, for callers holding the status as text.
    pub async fn transition_status_named(
        &self,
        lesson_id: Ulid,
        actor: Actor,
        status: &str,
        reason: Option<String>,
        now: Ms,
    ) -> Result<Lesson, EngineError> {
        let to = status.parse()?;
        self.transition_status(lesson_id, actor, to, reason, now).await
    }

    pub async fn cancel_lesson(
        &self,
        lesson_id: Ulid,
        actor: Actor,
        reason: Option<String>,
        now: Ms,
    ) -> Result<Lesson, EngineError> {
        self.transition_status(lesson_id, actor, LessonStatus::Cancelled, reason, now)
            .await
    }

    /// Unattended transition that only fires if the lesson is still in `expected`.
    /// `Ok(None)` means someone else moved it first.
    pub(super) async fn system_transition(
        &self,
        lesson_id: Ulid,
        expected: LessonStatus,
        to: LessonStatus,
        reason: String,
        now: Ms,
        stamps: MeetingStamps,
    ) -> Result<Option<Lesson>, EngineError> {
        let mut guard = self.resolve_lesson_write(&lesson_id).await?;
        match guard.lesson(&lesson_id) {
            Some(lesson) if lesson.status == expected => {}
            Some(_) => return Ok(None),
            None => return Err(EngineError::NotFound(lesson_id)),
        }
        self.commit_transition(&mut guard, lesson_id, Actor::system(), to, Some(reason), now, stamps)
            .await
            .map(Some)
    }

    /// Write an authorized transition with its side effects. Billing moves first (refund or
    /// recharge) and is reversed if the journal write fails, so either both land or neither does.
    #[allow(clippy::too_many_arguments)]
    pub(super) async fn commit_transition(
        &self,
        ts: &mut TutorState,
        lesson_id: Ulid,
        actor: Actor,
        to: LessonStatus,
        reason: Option<String>,
        now: Ms,
        stamps: MeetingStamps,
    ) -> Result<Lesson, EngineError> {
        let lesson = ts.lesson(&lesson_id).ok_or(EngineError::NotFound(lesson_id))?;
        let plan = plan_effects(lesson, actor.role, to, now, &self.config);
        let from = lesson.status;
        let balance_id = lesson.package_assignment_id;

        // Back to scheduled: the lesson must win its time and slots again. It is not scheduled
        // right now, so the conflict check never matches the lesson itself.
        if to == LessonStatus::Scheduled {
            check_no_conflict(ts, lesson.date, &lesson.span)?;
            if !plan.rebooked_hours.is_empty() {
                find_free_slots(ts, lesson.date, lesson.span.covered_hours(lesson.date))?;
            }
        }

        if plan.recharge_hours > 0 {
            self.balances
                .decrement_hours(balance_id, plan.recharge_hours)
                .await?;
        }
        if plan.refund_hours > 0 {
            self.balances
                .increment_hours(balance_id, plan.refund_hours)
                .await?;
        }

        let change = StatusChange {
            lesson_id,
            tutor_id: ts.id,
            from,
            to,
            reason,
            actor_id: actor.id,
            actor_role: actor.role,
            at: now,
            stamp_cancellation: plan.stamp_cancellation,
            released_hours: plan.released_hours,
            refunded_hours: plan.refund_hours,
            rebooked_hours: plan.rebooked_hours,
            recharged_hours: plan.recharge_hours,
            meeting_room_name: stamps.room_name,
            meeting_started_at: stamps.started_at,
            meeting_ended_at: stamps.ended_at,
            close_sessions: stamps.close_sessions,
        };
        let event = Event::StatusChanged { change };
        if let Err(e) = self.persist_and_apply(ts, &event).await {
            if plan.refund_hours > 0
                && let Err(undo) = self.balances.decrement_hours(balance_id, plan.refund_hours).await
            {
                error!("failed to take back refund on balance {balance_id} after aborted transition: {undo:?}");
            }
            if plan.recharge_hours > 0
                && let Err(undo) = self.balances.increment_hours(balance_id, plan.recharge_hours).await
            {
                error!("failed to return recharged hours to balance {balance_id} after aborted transition: {undo:?}");
            }
            return Err(e);
        }

        metrics::counter!(
            crate::observability::STATUS_TRANSITIONS_TOTAL,
            "to" => to.as_str(),
            "role" => actor.role.as_str()
        )
        .increment(1);
        if plan.refund_hours > 0 {
            metrics::counter!(crate::observability::HOURS_REFUNDED_TOTAL)
                .increment(plan.refund_hours as u64);
        }
        info!("lesson {lesson_id}: {from} -> {to} by {}", actor.role);

        ts.lesson(&lesson_id)
            .cloned()
            .ok_or(EngineError::NotFound(lesson_id))
    }

    /// Tutor (or staff) opens the meeting room: scheduled → in_progress with room and start stamped.
    pub async fn start_meeting(
        &self,
        lesson_id: Ulid,
        actor: Actor,
        room_name: String,
        now: Ms,
    ) -> Result<Lesson, EngineError> {
        if room_name.is_empty() {
            return Err(EngineError::InvalidRequest("room name is required"));
        }
        if room_name.len() > MAX_ROOM_NAME_LEN {
            return Err(EngineError::LimitExceeded("room name too long"));
        }
        let mut guard = self.resolve_lesson_write(&lesson_id).await?;
        let lesson = guard
            .lesson(&lesson_id)
            .ok_or(EngineError::NotFound(lesson_id))?;
        authorize(lesson, &actor, LessonStatus::InProgress, None, now)?;
        if lesson.status != LessonStatus::Scheduled {
            return Err(EngineError::InvalidTransition {
                from: lesson.status,
                to: LessonStatus::InProgress,
            });
        }
        if now < lesson.span.start - self.config.meeting_early_start_ms {
            return Err(EngineError::InvalidRequest("too early to start the lesson"));
        }
        let stamps = MeetingStamps {
            room_name: Some(room_name),
            started_at: Some(now),
            ..MeetingStamps::default()
        };
        self.commit_transition(&mut guard, lesson_id, actor, LessonStatus::InProgress, None, now, stamps)
            .await
    }

    /// Record a participant entering the room. Joining while already inside is a no-op.
    pub async fn join_meeting(&self, lesson_id: Ulid, actor: Actor, now: Ms) -> Result<Lesson, EngineError> {
        let mut guard = self.resolve_lesson_write(&lesson_id).await?;
        let lesson = guard
            .lesson(&lesson_id)
            .ok_or(EngineError::NotFound(lesson_id))?;
        if !is_participant(lesson, &actor) {
            return Err(EngineError::Forbidden("not a participant of this lesson"));
        }
        if lesson.status != LessonStatus::InProgress {
            return Err(EngineError::InvalidRequest("lesson is not in progress"));
        }
        if lesson.open_session(actor.id).is_some() {
            return Ok(lesson.clone());
        }
        let event = Event::SessionOpened {
            lesson_id,
            tutor_id: lesson.tutor_id,
            participant_id: actor.id,
            role: actor.role,
            at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        guard
            .lesson(&lesson_id)
            .cloned()
            .ok_or(EngineError::NotFound(lesson_id))
    }

    pub async fn leave_meeting(&self, lesson_id: Ulid, actor: Actor, now: Ms) -> Result<Lesson, EngineError> {
        let mut guard = self.resolve_lesson_write(&lesson_id).await?;
        let lesson = guard
            .lesson(&lesson_id)
            .ok_or(EngineError::NotFound(lesson_id))?;
        if lesson.open_session(actor.id).is_none() {
            return Err(EngineError::InvalidRequest("no open meeting session"));
        }
        let event = Event::SessionClosed {
            lesson_id,
            tutor_id: lesson.tutor_id,
            participant_id: actor.id,
            at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        guard
            .lesson(&lesson_id)
            .cloned()
            .ok_or(EngineError::NotFound(lesson_id))
    }
}
