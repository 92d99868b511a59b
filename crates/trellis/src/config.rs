use std::time::Duration;

/// Per-endpoint tuning knobs. The defaults match a small-message workload;
/// construct with [`Config::default`] and override through the `with_*`
/// builders.
#[derive(Debug, Clone)]
pub struct Config {
    /// Capacity of each connection's outbound buffer.
    pub write_buffer_size: usize,
    /// Largest encoded message accepted in either direction. Also bounds a
    /// single datagram payload.
    pub object_buffer_size: usize,
    /// Write-buffer free ratio above which `idle` fires after a drain.
    pub idle_threshold: f32,
    /// Close the connection when nothing is received for this long. Zero
    /// disables the check.
    pub timeout: Duration,
    /// Send an empty frame when nothing was sent for this long. Zero
    /// disables keep-alives.
    pub keep_alive: Duration,
    /// First byte of a discovery probe datagram.
    pub discovery_magic: u8,
    /// Optional kernel SO_SNDBUF/SO_RCVBUF override for stream sockets.
    pub socket_buf_size: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            write_buffer_size: 16 * 1024,
            object_buffer_size: 2 * 1024,
            idle_threshold: 0.1,
            timeout: Duration::from_secs(12),
            keep_alive: Duration::from_secs(8),
            discovery_magic: 0x2a,
            socket_buf_size: None,
        }
    }
}

impl Config {
    pub fn with_write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    pub fn with_object_buffer_size(mut self, size: usize) -> Self {
        self.object_buffer_size = size;
        self
    }

    pub fn with_idle_threshold(mut self, threshold: f32) -> Self {
        self.idle_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_discovery_magic(mut self, magic: u8) -> Self {
        self.discovery_magic = magic;
        self
    }

    pub fn with_socket_buf_size(mut self, size: usize) -> Self {
        self.socket_buf_size = Some(size);
        self
    }
}
