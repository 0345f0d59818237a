// ── Runtime configuration for the device core ──
//
// Built by the binary from `hearth-config` and handed to `HubContext::new`.
// Nothing in the core reads files or environment variables itself.

use std::time::Duration;

/// Tunables shared by every family, device and peer of one hub.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Ring-buffer capacity of each packet pipeline. One slot always stays
    /// empty, so at most `capacity - 1` packets can be queued.
    pub pipeline_capacity: usize,
    /// Packets taking longer than this to dispatch are reported at info level.
    pub slow_packet_threshold: Duration,
    /// Resend attempts before a peer is declared unreachable.
    pub unreach_resend_limit: u32,
    /// Bounded wait for the device list when saving a family.
    pub save_lock_timeout: Duration,
    /// Poll interval used while `unsubscribe` waits for in-flight dispatches.
    pub unsubscribe_poll_interval: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            pipeline_capacity: 1000,
            slow_packet_threshold: Duration::from_secs(1),
            unreach_resend_limit: 3,
            save_lock_timeout: Duration::from_millis(5000),
            unsubscribe_poll_interval: Duration::from_millis(1),
        }
    }
}
