use std::time::Duration;

use streamrpc_frame::FrameConfig;

/// Default name of a multiplexed channel's reader thread.
pub const DEFAULT_READER_THREAD_NAME: &str = "streamrpc-reader";

/// Configuration shared by both channel kinds.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Frame limits and socket timeouts.
    pub frame: FrameConfig,
    /// Upper bound on waiting for a response.
    ///
    /// A synchronous channel applies it as the socket read timeout; a
    /// multiplexed channel applies it in `call_blocking`.
    pub call_timeout: Option<Duration>,
    /// Name given to a multiplexed channel's reader thread.
    pub reader_thread_name: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            frame: FrameConfig::default(),
            call_timeout: None,
            reader_thread_name: DEFAULT_READER_THREAD_NAME.to_string(),
        }
    }
}

impl ChannelConfig {
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn with_reader_thread_name(mut self, name: impl Into<String>) -> Self {
        self.reader_thread_name = name.into();
        self
    }
}
