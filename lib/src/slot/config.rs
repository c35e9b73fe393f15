/// Environment variable holding debug flags for slot sets.
pub const SLOT_DEBUG_ENV: &str = "CODECBUF_SLOT_DEBUG";

/// Log every slot operation at trace level.
pub const SLOT_DEBUG_OPS: u32 = 1 << 0;
/// Report slot exhaustion as a retryable error instead of a fatal one.
pub const SLOT_DEBUG_RETRY_ON_EXHAUSTION: u32 = 1 << 1;

/// What `get_unused` does when all the slots are in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExhaustionPolicy {
    /// Running out of slots means the set has been undersized for the
    /// pipeline, and is reported as a fatal error.
    #[default]
    Fatal,
    /// Return `SlotError::NoFreeSlot` so the caller can wait for a slot to be
    /// released and try again.
    Retry,
}

#[derive(Debug, Clone)]
pub struct SlotsConfig {
    pub(super) history_size: usize,
    pub(super) exhaustion: ExhaustionPolicy,
    pub(super) log_ops: bool,
}

impl SlotsConfig {
    /// Number of operations a slot set remembers.
    pub const DEFAULT_HISTORY_SIZE: usize = 1024;

    pub fn new() -> Self {
        SlotsConfig {
            history_size: Self::DEFAULT_HISTORY_SIZE,
            exhaustion: ExhaustionPolicy::Fatal,
            log_ops: false,
        }
    }

    /// Default configuration, with debug flags read from the
    /// `CODECBUF_SLOT_DEBUG` environment variable.
    pub fn from_env() -> Self {
        let flags = crate::env_flags(SLOT_DEBUG_ENV);
        let exhaustion = if flags & SLOT_DEBUG_RETRY_ON_EXHAUSTION != 0 {
            ExhaustionPolicy::Retry
        } else {
            ExhaustionPolicy::Fatal
        };

        SlotsConfig::new()
            .log_ops(flags & SLOT_DEBUG_OPS != 0)
            .exhaustion(exhaustion)
    }

    /// Number of operations remembered for diagnostics. The history is
    /// cleared each time new frame geometry is committed.
    pub fn history_size(self, history_size: usize) -> Self {
        SlotsConfig {
            history_size,
            ..self
        }
    }

    pub fn exhaustion(self, exhaustion: ExhaustionPolicy) -> Self {
        SlotsConfig { exhaustion, ..self }
    }

    pub fn log_ops(self, log_ops: bool) -> Self {
        SlotsConfig { log_ops, ..self }
    }
}

impl Default for SlotsConfig {
    fn default() -> Self {
        SlotsConfig::new()
    }
}
