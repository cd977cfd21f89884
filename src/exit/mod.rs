// =============================================================================
// Exit Management Module
// =============================================================================
//
// A background exit monitor loop that evaluates all open positions against
// the unified position-lifecycle rules (spec.md §4.K) every few seconds.

pub mod monitor;
