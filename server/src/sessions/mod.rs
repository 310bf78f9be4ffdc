//! Session registry and event fan-out.

mod broadcast;
mod manager;

pub use broadcast::Broadcaster;
pub use manager::*;

use timetable_engine::Timestamp;

/// Wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as Timestamp
}
