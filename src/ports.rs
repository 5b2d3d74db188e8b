//! Collaborators the engine consumes but does not own: billing balances and the video provider.

use async_trait::async_trait;
use dashmap::DashMap;
use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::{Lesson, Ms, PackageBalance};

#[async_trait]
pub trait PackageBalanceStore: Send + Sync {
    /// The balance a booking costing `hours` should draw from. `NoActivePackage` when nothing is
    /// bookable at `now`, `InsufficientHours` when no single package covers `hours`.
    async fn active_balance(&self, student_id: Ulid, hours: u32, now: Ms) -> Result<PackageBalance, EngineError>;

    /// Atomically take `hours`. Fails with `InsufficientHours` instead of going negative.
    async fn decrement_hours(&self, balance_id: Ulid, hours: u32) -> Result<PackageBalance, EngineError>;

    async fn increment_hours(&self, balance_id: Ulid, hours: u32) -> Result<PackageBalance, EngineError>;
}

#[async_trait]
pub trait MeetingProvider: Send + Sync {
    /// How long the room has had nobody in it; 0 while occupied.
    async fn room_empty_for(&self, room_name: &str) -> Result<Ms, EngineError>;

    /// Returns false when the room was already gone.
    async fn delete_room(&self, room_name: &str) -> Result<bool, EngineError>;

    fn has_meeting_room(&self, lesson: &Lesson) -> bool;
}

/// Balance store backed by a concurrent map; each entry mutation holds its shard lock.
#[derive(Default)]
pub struct InMemoryBalances {
    balances: DashMap<Ulid, PackageBalance>,
}

impl InMemoryBalances {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, balance: PackageBalance) {
        self.balances.insert(balance.id, balance);
    }

    pub fn get(&self, id: &Ulid) -> Option<PackageBalance> {
        self.balances.get(id).map(|e| e.value().clone())
    }
}

#[async_trait]
impl PackageBalanceStore for InMemoryBalances {
    async fn active_balance(&self, student_id: Ulid, hours: u32, now: Ms) -> Result<PackageBalance, EngineError> {
        let mut picked: Option<PackageBalance> = None;
        let mut largest_short: Option<u32> = None;
        for entry in self.balances.iter() {
            let balance = entry.value();
            if balance.student_id != student_id || !balance.is_bookable(now) {
                continue;
            }
            if balance.hours_remaining < hours {
                largest_short = largest_short.max(Some(balance.hours_remaining));
                continue;
            }
            // Soonest-expiring first so hours are not stranded in a package about to lapse.
            if picked.as_ref().is_none_or(|p| balance.expires_at < p.expires_at) {
                picked = Some(balance.clone());
            }
        }
        match (picked, largest_short) {
            (Some(balance), _) => Ok(balance),
            (None, Some(remaining)) => Err(EngineError::InsufficientHours { needed: hours, remaining }),
            (None, None) => Err(EngineError::NoActivePackage(student_id)),
        }
    }

    async fn decrement_hours(&self, balance_id: Ulid, hours: u32) -> Result<PackageBalance, EngineError> {
        let mut entry = self
            .balances
            .get_mut(&balance_id)
            .ok_or(EngineError::NotFound(balance_id))?;
        if entry.hours_remaining < hours {
            return Err(EngineError::InsufficientHours {
                needed: hours,
                remaining: entry.hours_remaining,
            });
        }
        entry.hours_remaining -= hours;
        Ok(entry.value().clone())
    }

    async fn increment_hours(&self, balance_id: Ulid, hours: u32) -> Result<PackageBalance, EngineError> {
        let mut entry = self
            .balances
            .get_mut(&balance_id)
            .ok_or(EngineError::NotFound(balance_id))?;
        entry.hours_remaining = entry.hours_remaining.saturating_add(hours);
        Ok(entry.value().clone())
    }
}
