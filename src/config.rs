/// Capacity of the done channel `Peer::call` creates when none is supplied
pub const DEFAULT_DONE_CAPACITY: usize = 10;

/// Peer configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// Buffer of internally created done channels (at least 1)
    pub done_capacity: usize,
    /// Upper bound on notification handlers running at once; `None` = unbounded
    pub max_concurrent_handlers: Option<usize>,
    /// Exit the process with status 1 on a protocol violation
    pub exit_on_protocol_error: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            done_capacity: DEFAULT_DONE_CAPACITY,
            max_concurrent_handlers: None,
            exit_on_protocol_error: false,
        }
    }
}

impl PeerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_done_capacity(mut self, capacity: usize) -> Self {
        self.done_capacity = capacity.max(1);
        self
    }

    pub fn with_max_concurrent_handlers(mut self, limit: Option<usize>) -> Self {
        self.max_concurrent_handlers = limit.map(|n| n.max(1));
        self
    }

    pub fn with_exit_on_protocol_error(mut self, exit: bool) -> Self {
        self.exit_on_protocol_error = exit;
        self
    }
}
