//! The module containing various constants that may be modified by developers.

/// The logging level.
pub const LOGGING_LEVEL: log::LevelFilter = log::LevelFilter::Debug;

/// Mode value expected in `r00` for a register-based vmcall.
pub const VMCALL_MODE_REGISTERS: u64 = 2;

/// Magic number expected in `r01` before any vmcall is dispatched.
pub const VMCALL_MAGIC: u64 = 0xB045_EACD_ACD5_2E22;

/// The maximum number of records held by the flip log. When the log is full
/// the oldest record is evicted to make room.
pub const MAX_FLIP_RECORDS: usize = 512;

/// Number of consecutive EPT violations at the same RIP tolerated before the
/// handler single-steps the instruction under the clean EPT view.
pub const THRASH_REPEAT_LIMIT: u32 = 3;
