//! Network Settings
//!
//! Timeouts and limits shared by the transport layer and the node.

use std::time::Duration;

/// Network tuning knobs.
#[derive(Debug, Clone)]
pub struct NetworkSettings {
    /// Outbound connect timeout.
    pub connect_timeout: Duration,
    /// Time a fresh peer has to send `Hello`.
    pub handshake_timeout: Duration,
    /// Time `join` waits for the host's answer.
    pub join_timeout: Duration,
    /// Interval between keep-alive echoes.
    pub keep_alive_interval: Duration,
    /// Time a peer has to answer an echo, and to take our queued frames.
    pub echo_timeout: Duration,
    /// Service timer granularity. Periods under 1 ms are raised to 1 ms.
    pub tick_interval: Duration,
    /// Largest accepted frame (bytes, excluding the length prefix).
    pub max_frame_length: usize,
    /// Per-connection outbound queue capacity.
    pub outbound_queue: usize,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            join_timeout: Duration::from_secs(15),
            keep_alive_interval: Duration::from_secs(5),
            echo_timeout: Duration::from_secs(10),
            tick_interval: Duration::from_millis(100),
            max_frame_length: 4 * 1024 * 1024,
            outbound_queue: 256,
        }
    }
}

impl NetworkSettings {
    /// Create settings from environment variables, falling back to defaults.
    ///
    /// Durations are read in milliseconds from `TABLE_NET_CONNECT_TIMEOUT_MS`,
    /// `TABLE_NET_HANDSHAKE_TIMEOUT_MS`, `TABLE_NET_JOIN_TIMEOUT_MS`,
    /// `TABLE_NET_KEEP_ALIVE_MS`, `TABLE_NET_ECHO_TIMEOUT_MS` and
    /// `TABLE_NET_TICK_MS`; sizes from `TABLE_NET_MAX_FRAME` and
    /// `TABLE_NET_OUTBOUND_QUEUE`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            connect_timeout: env_millis("TABLE_NET_CONNECT_TIMEOUT_MS")
                .unwrap_or(defaults.connect_timeout),
            handshake_timeout: env_millis("TABLE_NET_HANDSHAKE_TIMEOUT_MS")
                .unwrap_or(defaults.handshake_timeout),
            join_timeout: env_millis("TABLE_NET_JOIN_TIMEOUT_MS")
                .unwrap_or(defaults.join_timeout),
            keep_alive_interval: env_millis("TABLE_NET_KEEP_ALIVE_MS")
                .unwrap_or(defaults.keep_alive_interval),
            echo_timeout: env_millis("TABLE_NET_ECHO_TIMEOUT_MS")
                .unwrap_or(defaults.echo_timeout),
            tick_interval: env_millis("TABLE_NET_TICK_MS").unwrap_or(defaults.tick_interval),
            max_frame_length: env_usize("TABLE_NET_MAX_FRAME")
                .unwrap_or(defaults.max_frame_length),
            outbound_queue: env_usize("TABLE_NET_OUTBOUND_QUEUE")
                .unwrap_or(defaults.outbound_queue),
        }
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.trim().parse().ok().filter(|v| *v > 0)
}

fn env_millis(name: &str) -> Option<Duration> {
    env_usize(name).map(|ms| Duration::from_millis(ms as u64))
}
