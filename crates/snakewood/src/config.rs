use std::time::Duration;

/// Configuration for a snakewood router.
#[derive(Clone)]
pub struct Config {
    /// How often a root node pushes its announcement to peers. Default: 5 seconds.
    pub announce_interval: Duration,
    /// Time without a fresh announcement before a peer's tree info is stale. Default: 10 seconds.
    pub announce_timeout: Duration,
    /// How often snake maintenance runs. Default: 1 second.
    pub snake_maintain_interval: Duration,
    /// Time without refresh before a snake neighbour or transit path expires. Default: 1 hour.
    pub neighbour_expiry: Duration,
    /// Capacity of each peer's outbound frame channel. Default: 512.
    pub peer_channel_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            announce_interval: Duration::from_secs(5),
            announce_timeout: Duration::from_secs(10),
            snake_maintain_interval: Duration::from_secs(1),
            neighbour_expiry: Duration::from_secs(60 * 60),
            peer_channel_size: 512,
        }
    }
}

impl Config {
    pub fn with_announce_interval(mut self, d: Duration) -> Self {
        self.announce_interval = d;
        self
    }

    pub fn with_announce_timeout(mut self, d: Duration) -> Self {
        self.announce_timeout = d;
        self
    }

    pub fn with_snake_maintain_interval(mut self, d: Duration) -> Self {
        self.snake_maintain_interval = d;
        self
    }

    pub fn with_neighbour_expiry(mut self, d: Duration) -> Self {
        self.neighbour_expiry = d;
        self
    }

    pub fn with_peer_channel_size(mut self, size: usize) -> Self {
        self.peer_channel_size = size;
        self
    }
}
