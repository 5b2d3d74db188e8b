//! Lesson scheduling engine: hourly tutor availability, double-booking-safe lesson booking
//! against student hour packages, a permission-checked lesson status machine with refund and
//! slot-release side effects, and sweeps that settle stalled or abandoned lessons.

pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod ports;
pub mod sweeper;
pub mod wal;
