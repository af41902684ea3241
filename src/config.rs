// src/config.rs - Server configuration
//
// Plain structs with defaults. Timings are in milliseconds.

/// Chunk size every RTMP peer starts with.
pub const DEFAULT_CHUNK_SIZE: u32 = 128;

/// Connection level timings and limits.
#[derive(Debug, Clone)]
pub struct RtmpConfig {
    /// Keep-alive ping interval. `0` disables the keep-alive job.
    pub ping_interval: u64,
    /// Delay between a successful connect and the first keep-alive tick.
    pub keep_alive_grace: u64,
    /// Inactivity after which a silent client is torn down.
    pub max_inactivity: u64,
    /// Time a fresh session has to reach the connected state.
    pub handshake_timeout: u64,
    /// Advisory deadline stamped on every received packet.
    pub max_handling_timeout: u64,
    /// Poll timeout of the per-connection receive consumer.
    pub receive_poll_timeout: u64,
    /// Slice used when retrying the write permit.
    pub write_lock_slice: u64,
    /// Chunk size announced on the first play/publish, only when above 128.
    pub chunk_size: u32,
    /// Acknowledgement window sent after connect.
    pub bandwidth_window: u32,
    /// Highest stream id (exclusive) a connection may reserve.
    pub max_streams: u32,
}

impl Default for RtmpConfig {
    fn default() -> Self {
        Self {
            ping_interval: 5000,
            keep_alive_grace: 2000,
            max_inactivity: 60000,
            handshake_timeout: 10000,
            max_handling_timeout: 500,
            receive_poll_timeout: 1000,
            write_lock_slice: 10,
            chunk_size: 4096,
            bandwidth_window: 2_500_000,
            max_streams: 320,
        }
    }
}

/// Tuning of the subscriber play engine.
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Interval of the pull/push tick for VOD playback.
    pub pull_interval: u64,
    /// Interval of the deferred stop check once a source ran dry.
    pub deferred_stop_interval: u64,
    /// How long a `-2` play waits for a live publisher.
    pub live_wait_timeout: u64,
    /// Pending message count above which a subscriber is considered behind.
    pub underrun_trigger: usize,
    /// Minimum gap between two insufficient bandwidth notifications.
    pub buffer_check_interval: u64,
    /// Pending video frames above which live video is dropped.
    pub max_pending_video_frames: usize,
    /// Consecutive frames with pending video above which live video is dropped.
    pub max_sequential_pending_video_frames: u32,
    /// Keep interframes after the last keyframe so late joiners can catch up.
    pub buffer_interframes: bool,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            pull_interval: 10,
            deferred_stop_interval: 100,
            live_wait_timeout: 15000,
            underrun_trigger: 10,
            buffer_check_interval: 5000,
            max_pending_video_frames: 10,
            max_sequential_pending_video_frames: 10,
            buffer_interframes: false,
        }
    }
}

/// Shared object engine settings.
#[derive(Debug, Clone)]
pub struct SharedObjectConfig {
    /// Bounded wait for the attribute lock on single attribute writes.
    pub lock_timeout: u64,
}

impl Default for SharedObjectConfig {
    fn default() -> Self {
        Self { lock_timeout: 100 }
    }
}

/// Everything a server instance is configured with.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub rtmp: RtmpConfig,
    pub playback: PlaybackConfig,
    pub shared_objects: SharedObjectConfig,
    /// Worker threads for handler execution and async delivery.
    pub worker_threads: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let worker_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2)
            .max(2);
        Self {
            rtmp: RtmpConfig::default(),
            playback: PlaybackConfig::default(),
            shared_objects: SharedObjectConfig::default(),
            worker_threads,
        }
    }
}

impl ServerConfig {
    /// Sets the keep-alive ping interval, `0` disables pings.
    pub fn set_ping_interval(mut self, ping_interval: u64) -> Self {
        self.rtmp.ping_interval = ping_interval;
        self
    }

    pub fn set_max_inactivity(mut self, max_inactivity: u64) -> Self {
        self.rtmp.max_inactivity = max_inactivity;
        self
    }

    pub fn set_handshake_timeout(mut self, handshake_timeout: u64) -> Self {
        self.rtmp.handshake_timeout = handshake_timeout;
        self
    }

    /// Sets the chunk size negotiated on play/publish.
    pub fn set_chunk_size(mut self, chunk_size: u32) -> Self {
        self.rtmp.chunk_size = chunk_size;
        self
    }

    pub fn set_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads.max(1);
        self
    }

    pub fn set_playback(mut self, playback: PlaybackConfig) -> Self {
        self.playback = playback;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.rtmp.ping_interval, 5000);
        assert_eq!(config.rtmp.max_inactivity, 60000);
        assert_eq!(config.rtmp.handshake_timeout, 10000);
        assert_eq!(config.rtmp.max_streams, 320);
        assert_eq!(config.playback.underrun_trigger, 10);
        assert_eq!(config.playback.live_wait_timeout, 15000);
        assert_eq!(config.shared_objects.lock_timeout, 100);
        assert!(config.worker_threads >= 2);
    }

    #[test]
    fn test_setters_chain() {
        let config = ServerConfig::default()
            .set_ping_interval(0)
            .set_chunk_size(128)
            .set_worker_threads(0);
        assert_eq!(config.rtmp.ping_interval, 0);
        assert_eq!(config.rtmp.chunk_size, 128);
        assert_eq!(config.worker_threads, 1);
    }
}
