//! Who may move a lesson where, and what each move does besides changing the status.
//!
//! Both halves are tables so the rules can be read and tested without an engine.

use crate::config::EngineConfig;
use crate::model::*;

use super::EngineError;

use crate::model::LessonStatus::*;

// ── Permissions ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Any target, from any status, on any lesson.
    Override,
    /// Listed targets on the actor's own lessons, along the lifecycle graph only.
    Own(&'static [LessonStatus]),
}

const TUTOR_TARGETS: &[LessonStatus] = &[InProgress, Completed, NoShowStudent, TechnicalIssues, Cancelled];
const STUDENT_TARGETS: &[LessonStatus] = &[Cancelled];

pub fn capability(role: Role) -> Capability {
    match role {
        Role::Admin | Role::Moderator | Role::System => Capability::Override,
        Role::Tutor => Capability::Own(TUTOR_TARGETS),
        Role::Student => Capability::Own(STUDENT_TARGETS),
    }
}

/// Lifecycle edges for non-override actors. Statuses without a row are terminal.
const EDGES: &[(LessonStatus, &[LessonStatus])] = &[
    (Scheduled, &[InProgress, Cancelled, NotStarted]),
    (InProgress, &[Completed, NoShowStudent, NoShowTutor, TechnicalIssues]),
];

pub fn is_edge(from: LessonStatus, to: LessonStatus) -> bool {
    EDGES
        .iter()
        .any(|(src, targets)| *src == from && targets.contains(&to))
}

fn owns(lesson: &Lesson, actor: &Actor) -> bool {
    match actor.role {
        Role::Tutor => lesson.tutor_id == actor.id,
        Role::Student => lesson.student_id == actor.id,
        Role::Admin | Role::Moderator | Role::System => false,
    }
}

pub fn authorize(
    lesson: &Lesson,
    actor: &Actor,
    to: LessonStatus,
    reason: Option<&str>,
    now: Ms,
) -> Result<(), EngineError> {
    let from = lesson.status;
    if from == to {
        return Err(EngineError::InvalidTransition { from, to });
    }
    let targets = match capability(actor.role) {
        Capability::Override => return Ok(()),
        Capability::Own(targets) => targets,
    };
    if !owns(lesson, actor) {
        return Err(EngineError::Forbidden("not a participant of this lesson"));
    }
    if !targets.contains(&to) {
        return Err(EngineError::Forbidden(match actor.role {
            Role::Student => "students may only cancel lessons",
            _ => "tutors cannot set this status",
        }));
    }
    if from.is_terminal() {
        return Err(EngineError::AlreadyTerminal(from));
    }
    if to == Cancelled {
        if from != Scheduled || lesson.span.start <= now {
            return Err(EngineError::Forbidden("cannot cancel a lesson that already started"));
        }
        if actor.role == Role::Tutor && reason.is_none_or(|r| r.trim().is_empty()) {
            return Err(EngineError::InvalidRequest("a cancellation reason is required"));
        }
    }
    if !is_edge(from, to) {
        return Err(EngineError::InvalidTransition { from, to });
    }
    Ok(())
}

// ── Side effects ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundRule {
    Always,
    /// Only when cancelled at least the free-cancellation window before the start.
    OutsideFreeWindow,
}

impl RefundRule {
    fn applies(&self, lesson: &Lesson, now: Ms, config: &EngineConfig) -> bool {
        match self {
            RefundRule::Always => true,
            RefundRule::OutsideFreeWindow => {
                lesson.span.start - now >= config.free_cancellation_window_ms
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    StampCancellation,
    ReleaseSlots,
    Refund(RefundRule),
    /// Undo an earlier release and refund: take the slots and the hours back.
    Reinstate,
}

struct EffectRule {
    /// `None` matches any source status.
    from: Option<LessonStatus>,
    to: LessonStatus,
    roles: &'static [Role],
    effects: &'static [Effect],
}

const CANCEL_BY_STUDENT: &[Effect] = &[
    Effect::StampCancellation,
    Effect::ReleaseSlots,
    Effect::Refund(RefundRule::OutsideFreeWindow),
];
const CANCEL_BY_OTHERS: &[Effect] = &[
    Effect::StampCancellation,
    Effect::ReleaseSlots,
    Effect::Refund(RefundRule::Always),
];
// Slot stays consumed: it records the tutor's committed time.
const TUTOR_ABSENT: &[Effect] = &[Effect::Refund(RefundRule::Always)];

const REINSTATE: &[Effect] = &[Effect::Reinstate];

const ALL_ROLES: &[Role] = &[Role::Admin, Role::Moderator, Role::Tutor, Role::Student, Role::System];

/// First matching row wins.
static EFFECT_TABLE: &[EffectRule] = &[
    EffectRule {
        from: None,
        to: Cancelled,
        roles: &[Role::Student],
        effects: CANCEL_BY_STUDENT,
    },
    EffectRule {
        from: None,
        to: Cancelled,
        roles: &[Role::Tutor, Role::Admin, Role::Moderator, Role::System],
        effects: CANCEL_BY_OTHERS,
    },
    EffectRule {
        from: None,
        to: NoShowTutor,
        roles: ALL_ROLES,
        effects: TUTOR_ABSENT,
    },
    EffectRule {
        from: None,
        to: Scheduled,
        roles: ALL_ROLES,
        effects: REINSTATE,
    },
];

pub fn effects_for(from: LessonStatus, to: LessonStatus, role: Role) -> &'static [Effect] {
    EFFECT_TABLE
        .iter()
        .find(|rule| {
            rule.to == to && rule.from.is_none_or(|f| f == from) && rule.roles.contains(&role)
        })
        .map(|rule| rule.effects)
        .unwrap_or(&[])
}

/// Concrete side effects of one transition. Each lesson releases slots and refunds at most once
/// until a reinstatement takes both back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EffectPlan {
    pub stamp_cancellation: bool,
    pub released_hours: Vec<u8>,
    pub refund_hours: u32,
    pub rebooked_hours: Vec<u8>,
    pub recharge_hours: u32,
}

pub fn plan_effects(
    lesson: &Lesson,
    role: Role,
    to: LessonStatus,
    now: Ms,
    config: &EngineConfig,
) -> EffectPlan {
    let mut plan = EffectPlan::default();
    for effect in effects_for(lesson.status, to, role) {
        match effect {
            Effect::StampCancellation => plan.stamp_cancellation = true,
            Effect::ReleaseSlots if !lesson.slots_released => {
                plan.released_hours = lesson.slot_hours.clone();
            }
            Effect::ReleaseSlots => {}
            Effect::Refund(rule) => {
                if lesson.hours_refunded == 0 && rule.applies(lesson, now, config) {
                    plan.refund_hours = lesson.hours_charged;
                }
            }
            Effect::Reinstate => {
                if lesson.slots_released {
                    plan.rebooked_hours = lesson.slot_hours.clone();
                }
                plan.recharge_hours = lesson.hours_refunded;
            }
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    const START: Ms = 20157 * DAY_MS + 10 * HOUR_MS;

    fn lesson(status: LessonStatus) -> Lesson {
        Lesson {
            id: Ulid::new(),
            student_id: Ulid::new(),
            tutor_id: Ulid::new(),
            package_assignment_id: Ulid::new(),
            date: 20157,
            span: Span::new(START, START + 90 * MINUTE_MS),
            duration_minutes: 90,
            slot_hours: vec![10, 11],
            price: 4_000,
            hours_charged: 2,
            hours_refunded: 0,
            slots_released: false,
            status,
            status_reason: None,
            status_updated_by: None,
            status_updated_at: None,
            cancelled_at: None,
            cancelled_by: None,
            meeting_room_name: None,
            meeting_started_at: None,
            meeting_ended_at: None,
            sessions: Vec::new(),
            created_at: 0,
        }
    }

    #[test]
    fn student_can_never_complete() {
        let l = lesson(Scheduled);
        let student = Actor::student(l.student_id);
        for from in LessonStatus::ALL {
            let mut l = l.clone();
            l.status = from;
            if from == Completed {
                continue;
            }
            assert!(matches!(
                authorize(&l, &student, Completed, None, 0),
                Err(EngineError::Forbidden(_))
            ));
        }
    }

    #[test]
    fn strangers_are_forbidden() {
        let l = lesson(Scheduled);
        let other_tutor = Actor::tutor(Ulid::new());
        let other_student = Actor::student(Ulid::new());
        assert!(matches!(
            authorize(&l, &other_tutor, InProgress, None, 0),
            Err(EngineError::Forbidden(_))
        ));
        assert!(matches!(
            authorize(&l, &other_student, Cancelled, None, 0),
            Err(EngineError::Forbidden(_))
        ));
    }

    #[test]
    fn tutor_cancel_needs_reason_and_future_start() {
        let l = lesson(Scheduled);
        let tutor = Actor::tutor(l.tutor_id);
        let before = START - HOUR_MS;
        assert!(matches!(
            authorize(&l, &tutor, Cancelled, Some("  "), before),
            Err(EngineError::InvalidRequest(_))
        ));
        assert!(authorize(&l, &tutor, Cancelled, Some("illness"), before).is_ok());
        assert!(matches!(
            authorize(&l, &tutor, Cancelled, Some("illness"), START),
            Err(EngineError::Forbidden("cannot cancel a lesson that already started"))
        ));
    }

    #[test]
    fn tutor_follows_lifecycle_graph() {
        let l = lesson(Scheduled);
        let tutor = Actor::tutor(l.tutor_id);
        assert!(authorize(&l, &tutor, InProgress, None, START).is_ok());
        assert!(matches!(
            authorize(&l, &tutor, Completed, None, START),
            Err(EngineError::InvalidTransition { from: Scheduled, to: Completed })
        ));
        assert!(matches!(
            authorize(&l, &tutor, NoShowTutor, None, START),
            Err(EngineError::Forbidden(_))
        ));

        let l = lesson(Completed);
        assert!(matches!(
            authorize(&l, &Actor::tutor(l.tutor_id), TechnicalIssues, None, START),
            Err(EngineError::AlreadyTerminal(Completed))
        ));
    }

    #[test]
    fn staff_override_terminal() {
        let l = lesson(NotStarted);
        assert!(authorize(&l, &Actor::admin(Ulid::new()), Cancelled, None, START + DAY_MS).is_ok());
        assert!(authorize(&l, &Actor::system(), Completed, None, 0).is_ok());
        assert!(matches!(
            authorize(&l, &Actor::system(), NotStarted, None, 0),
            Err(EngineError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn effect_table_lookup() {
        assert_eq!(effects_for(Scheduled, Cancelled, Role::Student), CANCEL_BY_STUDENT);
        assert_eq!(effects_for(Scheduled, Cancelled, Role::Tutor), CANCEL_BY_OTHERS);
        assert_eq!(effects_for(InProgress, NoShowTutor, Role::Admin), TUTOR_ABSENT);
        assert!(effects_for(InProgress, Completed, Role::Tutor).is_empty());
        assert!(effects_for(Scheduled, NotStarted, Role::System).is_empty());
        assert_eq!(effects_for(Cancelled, Scheduled, Role::Admin), REINSTATE);
    }

    #[test]
    fn student_refund_depends_on_window() {
        let config = EngineConfig::default();
        let l = lesson(Scheduled);
        let early = plan_effects(&l, Role::Student, Cancelled, START - 13 * HOUR_MS, &config);
        assert_eq!(early.refund_hours, 2);
        assert_eq!(early.released_hours, vec![10, 11]);
        assert!(early.stamp_cancellation);

        let late = plan_effects(&l, Role::Student, Cancelled, START - 2 * HOUR_MS, &config);
        assert_eq!(late.refund_hours, 0);
        assert_eq!(late.released_hours, vec![10, 11]);

        let exactly = plan_effects(&l, Role::Student, Cancelled, START - 12 * HOUR_MS, &config);
        assert_eq!(exactly.refund_hours, 2);
    }

    #[test]
    fn tutor_absence_refunds_without_release() {
        let plan = plan_effects(&lesson(InProgress), Role::Admin, NoShowTutor, START, &EngineConfig::default());
        assert_eq!(plan.refund_hours, 2);
        assert!(plan.released_hours.is_empty());
        assert!(!plan.stamp_cancellation);
    }

    #[test]
    fn reinstating_takes_back_release_and_refund() {
        let mut l = lesson(Cancelled);
        l.hours_refunded = 2;
        l.slots_released = true;
        let plan = plan_effects(&l, Role::Admin, Scheduled, START, &EngineConfig::default());
        assert_eq!(plan.rebooked_hours, vec![10, 11]);
        assert_eq!(plan.recharge_hours, 2);
        assert_eq!(plan.refund_hours, 0);
        assert!(plan.released_hours.is_empty());

        // A late student cancellation forfeited the hours: nothing to charge again.
        l.hours_refunded = 0;
        let plan = plan_effects(&l, Role::Admin, Scheduled, START, &EngineConfig::default());
        assert_eq!(plan.recharge_hours, 0);

        // Tutor absence kept the slots consumed.
        let mut l = lesson(NoShowTutor);
        l.hours_refunded = 2;
        let plan = plan_effects(&l, Role::Admin, Scheduled, START, &EngineConfig::default());
        assert!(plan.rebooked_hours.is_empty());
        assert_eq!(plan.recharge_hours, 2);
    }

    #[test]
    fn effects_apply_once() {
        let mut l = lesson(NoShowTutor);
        l.hours_refunded = 2;
        l.slots_released = true;
        let plan = plan_effects(&l, Role::Admin, Cancelled, START, &EngineConfig::default());
        assert_eq!(plan.refund_hours, 0);
        assert!(plan.released_hours.is_empty());
        assert!(plan.stamp_cancellation);
    }
}
