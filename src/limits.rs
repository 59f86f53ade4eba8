//! Resource caps enforced on every connection (spec.md §4.3, §6).

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Limits {
    pub max_control_line: usize,
    pub max_payload: usize,
    pub max_subscriptions: usize,
    pub max_pending_bytes: usize,
    pub ping_interval: Duration,
    pub ping_max: u32,
    pub write_deadline: Duration,
}

impl Default for Limits {
    fn default() -> Limits {
        Limits {
            max_control_line: 4096,
            max_payload: 1024 * 1024,
            max_subscriptions: 0, // 0 = unlimited
            max_pending_bytes: 64 * 1024 * 1024,
            ping_interval: Duration::from_secs(120),
            ping_max: 2,
            write_deadline: Duration::from_secs(10),
        }
    }
}
