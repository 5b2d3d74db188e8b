mod booking;
mod conflict;
mod error;
mod policy;
mod queries;
mod slots;
mod status;
mod sweeps;

pub use error::EngineError;
pub use policy::{authorize, effects_for, plan_effects, Capability, Effect, EffectPlan, RefundRule};
pub use sweeps::{SweepFailure, SweepReport};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use tracing::warn;
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::ports::PackageBalanceStore;
use crate::wal::Wal;

pub type SharedTutorState = Arc<RwLock<TutorState>>;

// ── Journal writer task ──────────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        snapshot: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the journal. Appends that queue up while one fsync is running are committed together
/// by the next one; control commands are handled between batches, never inside one.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let mut batch: Vec<PendingAppend> = match cmd {
            WalCommand::Append { event, response } => vec![(event, response)],
            control => {
                handle_control(&mut wal, control);
                continue;
            }
        };
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                control => {
                    deferred = Some(control);
                    break;
                }
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(control) = deferred {
            handle_control(&mut wal, control);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();
    let appended = batch.iter().try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes never ride along with the next batch.
    let flushed = wal.flush_sync();
    let outcome = appended.and(flushed);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, response) in batch {
        let reply = match &outcome {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = response.send(reply);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { snapshot, response } => {
            let _ = response.send(wal.rewrite(&snapshot));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub(super) tutors: DashMap<Ulid, SharedTutorState>,
    /// Reverse lookup: lesson id → tutor id
    pub(super) lesson_index: DashMap<Ulid, Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) balances: Arc<dyn PackageBalanceStore>,
    /// Held by tutor registration and compaction so a snapshot never misses a new tutor.
    pub(super) registry: Mutex<()>,
    pub notify: Arc<NotifyHub>,
    pub config: EngineConfig,
}

/// Apply a journal event to one tutor's state. Caller holds the write lock.
fn apply_to_tutor(ts: &mut TutorState, event: &Event, lesson_index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::HourlyRateChanged { hourly_rate, .. } => ts.hourly_rate = *hourly_rate,
        Event::SlotsPublished { date, hours, .. } => {
            for &hour in hours {
                ts.slots
                    .entry((*date, hour))
                    .or_insert_with(|| AvailabilitySlot::new(*date, hour))
                    .is_available = true;
            }
        }
        Event::SlotsWithdrawn { date, hours, .. } => {
            for hour in hours {
                if let Some(slot) = ts.slots.get_mut(&(*date, *hour)) {
                    slot.is_available = false;
                }
            }
        }
        Event::LessonBooked { lesson } => {
            for &hour in &lesson.slot_hours {
                if let Some(slot) = ts.slots.get_mut(&(lesson.date, hour))
                    && let Err(e) = slots::book_hours(slot, 1)
                {
                    warn!("lesson {} applied over inconsistent slot: {e}", lesson.id);
                }
            }
            lesson_index.insert(lesson.id, ts.id);
            ts.insert_lesson(lesson.clone());
        }
        Event::StatusChanged { change } => apply_status_change(ts, change),
        Event::SessionOpened {
            lesson_id,
            participant_id,
            role,
            at,
            ..
        } => {
            if let Some(lesson) = ts.lesson_mut(lesson_id) {
                lesson.sessions.push(MeetingSession {
                    participant_id: *participant_id,
                    role: *role,
                    joined_at: *at,
                    left_at: None,
                });
            }
        }
        Event::SessionClosed {
            lesson_id,
            participant_id,
            at,
            ..
        } => {
            if let Some(lesson) = ts.lesson_mut(lesson_id)
                && let Some(session) = lesson
                    .sessions
                    .iter_mut()
                    .find(|s| s.participant_id == *participant_id && s.is_open())
            {
                session.left_at = Some(*at);
            }
        }
        Event::SlotRestored { slot, .. } => {
            ts.slots.insert((slot.date, slot.start_hour), *slot);
        }
        Event::LessonRestored { lesson, history } => {
            lesson_index.insert(lesson.id, ts.id);
            ts.insert_lesson(lesson.clone());
            ts.history.extend(history.iter().cloned());
        }
        // Handled at the map level.
        Event::TutorRegistered { .. } => {}
    }
}

fn apply_status_change(ts: &mut TutorState, change: &StatusChange) {
    let Some(lesson) = ts.lesson_mut(&change.lesson_id) else {
        warn!("status change for unknown lesson {}", change.lesson_id);
        return;
    };
    lesson.status = change.to;
    lesson.status_reason = change.reason.clone();
    lesson.status_updated_by = Some(change.actor_id);
    lesson.status_updated_at = Some(change.at);
    if change.stamp_cancellation {
        lesson.cancelled_at = Some(change.at);
        lesson.cancelled_by = Some(change.actor_role);
    }
    if change.to == LessonStatus::Scheduled {
        lesson.cancelled_at = None;
        lesson.cancelled_by = None;
    }
    if !change.released_hours.is_empty() {
        lesson.slots_released = true;
    }
    if !change.rebooked_hours.is_empty() {
        lesson.slots_released = false;
    }
    lesson.hours_refunded += change.refunded_hours;
    lesson.hours_refunded = lesson.hours_refunded.saturating_sub(change.recharged_hours);
    if let Some(room) = &change.meeting_room_name {
        lesson.meeting_room_name = Some(room.clone());
    }
    if let Some(started) = change.meeting_started_at {
        lesson.meeting_started_at = Some(started);
    }
    if let Some(ended) = change.meeting_ended_at {
        lesson.meeting_ended_at = Some(ended);
    }
    if change.close_sessions {
        for session in lesson.sessions.iter_mut().filter(|s| s.is_open()) {
            session.left_at = Some(change.at);
        }
    }
    let date = lesson.date;

    for &hour in &change.released_hours {
        if let Some(slot) = ts.slots.get_mut(&(date, hour)) {
            slots::release_hours(slot, 1);
        }
    }
    for &hour in &change.rebooked_hours {
        if let Some(slot) = ts.slots.get_mut(&(date, hour))
            && let Err(e) = slots::book_hours(slot, 1)
        {
            warn!("lesson {} reinstated over inconsistent slot: {e}", change.lesson_id);
        }
    }
    ts.history.push(StatusHistoryEntry {
        lesson_id: change.lesson_id,
        status: change.to,
        previous_status: change.from,
        reason: change.reason.clone(),
        changed_by_role: change.actor_role,
        changed_by_user_id: change.actor_id,
        at: change.at,
    });
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        balances: Arc<dyn PackageBalanceStore>,
        config: EngineConfig,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            tutors: DashMap::new(),
            lesson_index: DashMap::new(),
            wal_tx,
            balances,
            registry: Mutex::new(()),
            notify,
            config,
        };

        // Sole owner of every Arc during replay, so try_write never contends. Blocking
        // variants would panic if this runs inside the runtime.
        for event in &events {
            if let Event::TutorRegistered { id, hourly_rate } = event {
                let ts = TutorState::new(*id, *hourly_rate);
                engine.tutors.insert(*id, Arc::new(RwLock::new(ts)));
                continue;
            }
            if let Some(entry) = engine.tutors.get(&event.tutor_id()) {
                let shared = entry.value().clone();
                drop(entry);
                let mut guard = shared.try_write().expect("replay: uncontended write");
                apply_to_tutor(&mut guard, event, &engine.lesson_index);
            }
        }

        Ok(engine)
    }

    /// Durably journal one event through the group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::JournalError("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::JournalError("journal writer dropped response".into()))?
            .map_err(|e| EngineError::JournalError(e.to_string()))
    }

    pub fn get_tutor(&self, id: &Ulid) -> Option<SharedTutorState> {
        self.tutors.get(id).map(|e| e.value().clone())
    }

    pub fn tutor_for_lesson(&self, lesson_id: &Ulid) -> Option<Ulid> {
        self.lesson_index.get(lesson_id).map(|e| *e.value())
    }

    /// Journal, apply, then fan out to listeners.
    pub(super) async fn persist_and_apply(
        &self,
        ts: &mut TutorState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_tutor(ts, event, &self.lesson_index);
        self.notify.send(ts.id, event);
        Ok(())
    }

    /// Lesson → tutor lookup, then the tutor's write lock.
    pub(super) async fn resolve_lesson_write(
        &self,
        lesson_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<TutorState>, EngineError> {
        let tutor_id = self
            .tutor_for_lesson(lesson_id)
            .ok_or(EngineError::NotFound(*lesson_id))?;
        let shared = self
            .get_tutor(&tutor_id)
            .ok_or(EngineError::NotFound(tutor_id))?;
        Ok(shared.write_owned().await)
    }

    /// Rewrite the journal as a snapshot of current state. Every tutor stays read-locked until
    /// the rewrite lands, so no mutation can slip between snapshot and swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _registry = self.registry.lock().await;
        let shared: Vec<SharedTutorState> = self.tutors.iter().map(|e| e.value().clone()).collect();
        let guards = futures::future::join_all(shared.iter().map(|s| s.read())).await;

        let mut snapshot = Vec::new();
        for ts in &guards {
            snapshot.push(Event::TutorRegistered {
                id: ts.id,
                hourly_rate: ts.hourly_rate,
            });
            for slot in ts.slots.values() {
                snapshot.push(Event::SlotRestored {
                    tutor_id: ts.id,
                    slot: *slot,
                });
            }
            for lesson in &ts.lessons {
                let history = ts
                    .history
                    .iter()
                    .filter(|h| h.lesson_id == lesson.id)
                    .cloned()
                    .collect();
                snapshot.push(Event::LessonRestored {
                    lesson: lesson.clone(),
                    history,
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { snapshot, response: tx })
            .await
            .map_err(|_| EngineError::JournalError("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::JournalError("journal writer dropped response".into()))?
            .map_err(|e| EngineError::JournalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
