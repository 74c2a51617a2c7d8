//! WarmPool and Sandbox controllers (spec.md §4.C, §4.D).
//!
//! Each submodule follows the same split as `scheduler.rs`: a pure
//! planning function that only looks at already-fetched state, and a
//! thin `kube`-calling shell (grounded in the teacher's
//! `backend::kubernetes_operator::reconcile_sandbox` /
//! `backend::kubernetes_pool::KubernetesPool`) that fetches state, calls
//! the plan, and executes it.

pub mod sandbox;
pub mod warmpool;

use std::sync::Arc;

use kube::Client;

/// Shared error type for both controllers' reconcile loops, matching the
/// teacher's `ReconcileError` (a thin wrapper so `kube::runtime::Controller`
/// can require `std::error::Error` without leaking `anyhow::Error` itself).
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct ReconcileError {
    #[from]
    source: anyhow::Error,
}

/// Context shared across reconcile invocations.
pub struct ControllerContext {
    pub client: Client,
    pub config: Arc<crate::config::ControllerConfig>,
}

/// Deterministic jitter in `[0, spread]` seconds derived from
/// `resourceVersion`, so that many pools/sandboxes reconciling on the same
/// base interval don't all requeue in lockstep. An LCG rather than a new
/// `rand` dependency — the spread only needs to look random, not be
/// cryptographically so.
pub fn jitter_seconds(resource_version: &str, spread: u64) -> u64 {
    if spread == 0 {
        return 0;
    }
    let mut seed: u64 = resource_version
        .bytes()
        .fold(1469598103934665603u64, |acc, b| {
            (acc ^ b as u64).wrapping_mul(1099511628211)
        });
    // One LCG step (Numerical Recipes constants) to mix the FNV seed further.
    seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    seed % spread
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_is_deterministic_and_bounded() {
        let a = jitter_seconds("12345", 10);
        let b = jitter_seconds("12345", 10);
        assert_eq!(a, b);
        assert!(a < 10);
    }

    #[test]
    fn jitter_zero_spread_is_zero() {
        assert_eq!(jitter_seconds("anything", 0), 0);
    }

    #[test]
    fn jitter_varies_with_resource_version() {
        let a = jitter_seconds("1", 1000);
        let b = jitter_seconds("2", 1000);
        assert_ne!(a, b);
    }
}
