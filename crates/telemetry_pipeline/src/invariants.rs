//! Debug assertion macros for pipeline invariants.
//!
//! Only active in debug builds (`debug_assert!`), so there is zero overhead in
//! release builds.

// =============================================================================
// Batch formation
// =============================================================================

/// Assert that a sealed batch never exceeds the configured size.
///
/// **Invariant**: `0 < batch.len() ≤ max_batch_size`
///
/// Used in: `BatchProcessor::seal()`
macro_rules! debug_assert_batch_bounded {
    ($len:expr, $max:expr) => {
        debug_assert!(
            $len > 0 && $len <= $max,
            "sealed batch has {} items, allowed 1..={}",
            $len,
            $max
        )
    };
}

/// Assert that every item in a batch belongs to the batch's lane.
///
/// **Invariant**: `∀ item ∈ batch: item.kind() == batch.kind()`
///
/// Used in: `Batch::seal()`
macro_rules! debug_assert_single_kind {
    ($items:expr, $kind:expr) => {
        debug_assert!(
            $items.iter().all(|item| item.kind() == $kind),
            "batch for {} contains items of another kind",
            $kind
        )
    };
}

// =============================================================================
// Export
// =============================================================================

/// Assert that the retry loop never runs past its attempt budget.
///
/// **Invariant**: `1 ≤ attempt ≤ max_attempts`
///
/// Used in: `RetryingExporter::export()`
macro_rules! debug_assert_attempts_bounded {
    ($attempt:expr, $max:expr) => {
        debug_assert!(
            $attempt >= 1 && $attempt <= $max,
            "export attempt {} outside budget 1..={}",
            $attempt,
            $max
        )
    };
}

// =============================================================================
// Lifecycle
// =============================================================================

/// Assert that a controller state change follows the lifecycle.
///
/// **Invariant**: `Stopped → Starting → Running → Draining → Stopped`
///
/// Used in: `StateCell::transition()`
macro_rules! debug_assert_valid_transition {
    ($from:expr, $to:expr) => {
        debug_assert!(
            matches!(
                ($from, $to),
                (PipelineState::Stopped, PipelineState::Starting)
                    | (PipelineState::Starting, PipelineState::Running)
                    | (PipelineState::Running, PipelineState::Draining)
                    | (PipelineState::Draining, PipelineState::Stopped)
            ),
            "invalid pipeline transition: {:?} -> {:?}",
            $from,
            $to
        )
    };
}

/// Assert that a closed span does not end before it started.
///
/// **Invariant**: `end_time ≥ start_time`
///
/// Used in: `SpanGuard::finish()`
macro_rules! debug_assert_span_closed {
    ($start:expr, $end:expr) => {
        debug_assert!(
            $end >= $start,
            "span ends at {} before it starts at {}",
            $end,
            $start
        )
    };
}

pub(crate) use debug_assert_attempts_bounded;
pub(crate) use debug_assert_batch_bounded;
pub(crate) use debug_assert_single_kind;
pub(crate) use debug_assert_span_closed;
pub(crate) use debug_assert_valid_transition;
