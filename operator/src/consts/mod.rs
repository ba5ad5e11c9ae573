pub mod injection;

/// Number of attempts for writes guarded by `resourceVersion` before the
/// conflict is surfaced.
pub const MAX_CONFLICT_RETRIES: usize = 5;
