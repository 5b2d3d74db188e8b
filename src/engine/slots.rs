use std::ops::Range;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

/// Take `n` hours of a slot. Slots hold at most one lesson.
pub(crate) fn book_hours(slot: &mut AvailabilitySlot, n: u8) -> Result<(), EngineError> {
    if slot.hours_booked.saturating_add(n) > AvailabilitySlot::CAPACITY {
        return Err(EngineError::AlreadyBooked {
            date: slot.date,
            hour: slot.start_hour,
        });
    }
    slot.hours_booked = (slot.hours_booked + n).min(AvailabilitySlot::CAPACITY);
    Ok(())
}

pub(crate) fn release_hours(slot: &mut AvailabilitySlot, n: u8) {
    slot.hours_booked = slot.hours_booked.saturating_sub(n);
}

/// Every hour in `hours` must have its own open, unbooked slot; one gap fails the whole range.
pub(crate) fn find_free_slots(
    ts: &TutorState,
    date: Day,
    hours: Range<u8>,
) -> Result<Vec<u8>, EngineError> {
    hours
        .map(|hour| match ts.slots.get(&(date, hour)) {
            Some(slot) if slot.is_free() => Ok(hour),
            _ => Err(EngineError::TutorUnavailable {
                tutor_id: ts.id,
                date,
                hour,
            }),
        })
        .collect()
}

/// Dates before the epoch or past `MAX_DAY` are refused rather than turned into instants.
pub(crate) fn validate_day(date: Day) -> Result<(), EngineError> {
    if !(0..=MAX_DAY).contains(&date) {
        return Err(EngineError::InvalidRequest("date out of range"));
    }
    Ok(())
}

fn validate_hours(hours: &[u8]) -> Result<(), EngineError> {
    if hours.is_empty() {
        return Err(EngineError::InvalidRequest("no hours given"));
    }
    if hours.len() > MAX_HOURS_PER_PUBLISH {
        return Err(EngineError::LimitExceeded("too many hours in one request"));
    }
    if hours.iter().any(|&h| h >= 24) {
        return Err(EngineError::InvalidRequest("hour must be in 0..24"));
    }
    Ok(())
}

impl Engine {
    pub async fn register_tutor(&self, id: Ulid, hourly_rate: u64) -> Result<(), EngineError> {
        let _registry = self.registry.lock().await;
        if self.tutors.len() >= MAX_TUTORS {
            return Err(EngineError::LimitExceeded("too many tutors"));
        }
        if self.tutors.contains_key(&id) {
            return Err(EngineError::InvalidRequest("tutor already registered"));
        }
        let event = Event::TutorRegistered { id, hourly_rate };
        self.wal_append(&event).await?;
        self.tutors
            .insert(id, Arc::new(RwLock::new(TutorState::new(id, hourly_rate))));
        self.notify.send(id, &event);
        Ok(())
    }

    pub async fn set_hourly_rate(&self, tutor_id: Ulid, hourly_rate: u64) -> Result<(), EngineError> {
        let shared = self
            .get_tutor(&tutor_id)
            .ok_or(EngineError::NotFound(tutor_id))?;
        let mut guard = shared.write().await;
        let event = Event::HourlyRateChanged {
            id: tutor_id,
            hourly_rate,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Open hourly slots on `date`. Re-publishing an existing slot re-opens it and keeps its booking.
    pub async fn publish_availability(
        &self,
        tutor_id: Ulid,
        date: Day,
        hours: &[u8],
    ) -> Result<(), EngineError> {
        validate_day(date)?;
        validate_hours(hours)?;
        let shared = self
            .get_tutor(&tutor_id)
            .ok_or(EngineError::NotFound(tutor_id))?;
        let mut guard = shared.write().await;
        let mut hours = hours.to_vec();
        hours.sort_unstable();
        hours.dedup();
        let event = Event::SlotsPublished {
            tutor_id,
            date,
            hours,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("tutor {tutor_id} published availability on day {date}");
        Ok(())
    }

    /// Close slots to new bookings. A booked slot must be freed by its lesson first.
    pub async fn withdraw_availability(
        &self,
        tutor_id: Ulid,
        date: Day,
        hours: &[u8],
    ) -> Result<(), EngineError> {
        validate_day(date)?;
        validate_hours(hours)?;
        let shared = self
            .get_tutor(&tutor_id)
            .ok_or(EngineError::NotFound(tutor_id))?;
        let mut guard = shared.write().await;
        for &hour in hours {
            match guard.slots.get(&(date, hour)) {
                None => return Err(EngineError::TutorUnavailable { tutor_id, date, hour }),
                Some(slot) if slot.hours_booked > 0 => {
                    return Err(EngineError::AlreadyBooked { date, hour });
                }
                Some(_) => {}
            }
        }
        let event = Event::SlotsWithdrawn {
            tutor_id,
            date,
            hours: hours.to_vec(),
        };
        self.persist_and_apply(&mut guard, &event).await
    }
}
