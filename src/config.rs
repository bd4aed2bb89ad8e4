//! Configuration for channels and servers, built in the builder idiom.

use std::net::SocketAddr;
use std::time::Duration;

use crate::reactor::DEFAULT_BUFFER_SIZE;

/// Per-channel options.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Keep a read registered whenever the channel is active. When disabled,
    /// reading stops after each burst until [`crate::channel::TcpChannel::read`]
    /// is called again.
    pub auto_read: bool,
    /// Fail the connect future and force-close the channel when the connect
    /// has not completed within this window. `None` disables the timer.
    pub connect_timeout: Option<Duration>,
    /// TCP_NODELAY on the socket.
    pub no_delay: bool,
    /// SO_KEEPALIVE on the socket.
    pub keep_alive: bool,
    /// Read buffer size requested from the owning reactor's pool.
    pub buffer_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            auto_read: true,
            connect_timeout: Some(Duration::from_secs(30)),
            no_delay: true,
            keep_alive: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl ChannelConfig {
    pub fn builder() -> ChannelConfigBuilder {
        ChannelConfigBuilder::default()
    }
}

#[derive(Default)]
pub struct ChannelConfigBuilder {
    auto_read: Option<bool>,
    connect_timeout: Option<Option<Duration>>,
    no_delay: Option<bool>,
    keep_alive: Option<bool>,
    buffer_size: Option<usize>,
}

impl ChannelConfigBuilder {
    pub fn auto_read(mut self, enabled: bool) -> Self {
        self.auto_read = Some(enabled);
        self
    }

    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = Some(enabled);
        self
    }

    pub fn keep_alive(mut self, enabled: bool) -> Self {
        self.keep_alive = Some(enabled);
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    pub fn build(self) -> ChannelConfig {
        let default = ChannelConfig::default();
        ChannelConfig {
            auto_read: self.auto_read.unwrap_or(default.auto_read),
            connect_timeout: self.connect_timeout.unwrap_or(default.connect_timeout),
            no_delay: self.no_delay.unwrap_or(default.no_delay),
            keep_alive: self.keep_alive.unwrap_or(default.keep_alive),
            buffer_size: self.buffer_size.unwrap_or(default.buffer_size),
        }
    }
}

/// Options for a [`crate::server::TcpServer`]: one dispatcher reactor owning
/// the listener plus a worker pool adopting the accepted sockets.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address the dispatcher binds its listener to.
    pub address: SocketAddr,
    /// Worker reactors accepting handed-off sockets.
    pub workers: usize,
    /// Options applied to every adopted channel.
    pub channel: ChannelConfig,
    /// Hard cap on concurrently adopted connections; excess accepts are
    /// closed at the dispatcher.
    pub max_connections: Option<usize>,
    /// How many times a worker retries connecting to the dispatcher pipe
    /// before giving up.
    pub pipe_connect_attempts: u32,
    /// Delay between pipe connect retries.
    pub pipe_connect_delay: Duration,
    /// Overall deadline for worker-pool construction.
    pub startup_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:0".parse().unwrap(),
            workers: crate::group::DEFAULT_POOL_CAPACITY,
            channel: ChannelConfig::default(),
            max_connections: None,
            pipe_connect_attempts: 10,
            pipe_connect_delay: Duration::from_millis(50),
            startup_timeout: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }
}

#[derive(Default)]
pub struct ServerConfigBuilder {
    address: Option<SocketAddr>,
    workers: Option<usize>,
    channel: Option<ChannelConfig>,
    max_connections: Option<usize>,
    pipe_connect_attempts: Option<u32>,
    pipe_connect_delay: Option<Duration>,
    startup_timeout: Option<Duration>,
}

impl ServerConfigBuilder {
    pub fn address(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    pub fn pipe_connect_attempts(mut self, attempts: u32) -> Self {
        self.pipe_connect_attempts = Some(attempts);
        self
    }

    pub fn pipe_connect_delay(mut self, delay: Duration) -> Self {
        self.pipe_connect_delay = Some(delay);
        self
    }

    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> ServerConfig {
        let default = ServerConfig::default();
        ServerConfig {
            address: self.address.unwrap_or(default.address),
            workers: self.workers.unwrap_or(default.workers),
            channel: self.channel.unwrap_or(default.channel),
            max_connections: self.max_connections.or(default.max_connections),
            pipe_connect_attempts: self
                .pipe_connect_attempts
                .unwrap_or(default.pipe_connect_attempts),
            pipe_connect_delay: self.pipe_connect_delay.unwrap_or(default.pipe_connect_delay),
            startup_timeout: self.startup_timeout.unwrap_or(default.startup_timeout),
        }
    }
}
