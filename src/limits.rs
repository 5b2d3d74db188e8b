//! Hard caps on request sizes and state growth.

pub const MAX_TUTORS: usize = 100_000;
pub const MAX_LESSONS_PER_TUTOR: usize = 50_000;
pub const MAX_LESSON_DURATION_MINUTES: u32 = 240;
pub const MAX_REASON_LEN: usize = 1_000;
pub const MAX_ROOM_NAME_LEN: usize = 128;
pub const MAX_HOURS_PER_PUBLISH: usize = 24;
/// Last bookable calendar day, 9999-12-31. Keeps instant arithmetic on dates far from overflow.
pub const MAX_DAY: i64 = 2_932_896;
