//! Reconciliation loop primitives.
//!
//! Pure arithmetic used by the node manager's reconciler to converge the
//! number of nodes of one size toward demand. Key concepts:
//!
//! - **Target**: demand for a size clamped into its `[min, max]` bounds.
//! - **Active**: nodes that count toward demand (booting, waiting to pair,
//!   idle, busy).
//! - **Leaving**: nodes already on their way out. They no longer count toward
//!   demand but still occupy a slot under the `max` cap until they are gone.
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inputs
//! - A delta never boots past `max - (active + leaving)`
//! - A delta never both grows and drains a size

use std::cmp::Reverse;
use std::time::Duration;

use thiserror::Error;

/// Reconciliation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// Bounds where the floor is above the ceiling.
    #[error("invalid bounds: min {min} exceeds max {max}")]
    InvalidBounds { min: u32, max: u32 },
}

/// Per-size node count bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaleBounds {
    min: u32,
    max: u32,
}

impl ScaleBounds {
    /// Create bounds, rejecting `min > max`.
    pub fn new(min: u32, max: u32) -> Result<Self, ReconcileError> {
        if min > max {
            return Err(ReconcileError::InvalidBounds { min, max });
        }
        Ok(Self { min, max })
    }

    /// Create bounds, lowering `min` to `max` when inverted.
    pub fn clamped(min: u32, max: u32) -> Self {
        Self {
            min: min.min(max),
            max,
        }
    }

    pub fn min(&self) -> u32 {
        self.min
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    /// Clamp raw demand into the bounds. Zero demand still yields `min`
    /// (keep-warm).
    pub fn clamp(&self, wanted: u32) -> u32 {
        wanted.clamp(self.min, self.max)
    }
}

/// Node counts for one size, as seen by one reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SizeCounts {
    /// Nodes that satisfy demand (booting, waiting to pair, idle, busy).
    pub active: u32,

    /// Nodes on their way out that may still hold a cloud instance.
    pub leaving: u32,

    /// Subset of `leaving` that can still be taken back (grace window not
    /// yet over).
    pub reclaimable: u32,
}

impl SizeCounts {
    /// Every node that may hold a cloud instance.
    pub fn total(&self) -> u32 {
        self.active + self.leaving
    }
}

/// Outcome of comparing one size's target with what exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScaleDelta {
    /// Clamped target.
    pub target: u32,

    /// New nodes to boot.
    pub boot: u32,

    /// Leaving nodes to take back before booting anything new.
    pub reclaim: u32,

    /// Surplus nodes to drain.
    pub drain: u32,

    /// Demand the `max` cap keeps from being met: the wishlist above `max`,
    /// plus boots withheld while leaving nodes still hold a slot.
    pub capped: u32,
}

impl ScaleDelta {
    /// Compute the delta for one size.
    ///
    /// The `max` cap is applied against `counts.total()`, so nodes that are
    /// shutting down still occupy a slot until they are gone.
    pub fn compute(bounds: ScaleBounds, wanted: u32, counts: SizeCounts) -> Self {
        let target = bounds.clamp(wanted);
        let active = counts.active;
        let over_max = wanted.saturating_sub(bounds.max);

        if active >= target {
            return Self {
                target,
                drain: active - target,
                capped: over_max,
                ..Self::default()
            };
        }

        let need = target - active;
        let reclaim = need.min(counts.reclaimable.min(counts.leaving));
        let rest = need - reclaim;
        let room = bounds.max.saturating_sub(counts.total());
        let boot = rest.min(room);

        Self {
            target,
            boot,
            reclaim,
            drain: 0,
            capped: over_max + (rest - boot),
        }
    }

    /// True when nothing needs to happen for this size.
    pub fn is_noop(&self) -> bool {
        self.boot == 0 && self.reclaim == 0 && self.drain == 0
    }
}

/// Convergence status for one size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Active nodes match the target and none are still booting.
    Converged,

    /// Count matches or is moving toward the target.
    Converging,

    /// Count is off target and nothing can be done this pass (capped or
    /// frozen).
    Diverged,
}

impl ConvergenceStatus {
    /// Assess a size after a delta was computed.
    ///
    /// `pending` is the number of active nodes that are not yet paired.
    pub fn assess(delta: &ScaleDelta, active: u32, pending: u32) -> Self {
        if active == delta.target && pending == 0 {
            Self::Converged
        } else if delta.is_noop() && active != delta.target {
            Self::Diverged
        } else {
            Self::Converging
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Converged => "converged",
            Self::Converging => "converging",
            Self::Diverged => "diverged",
        }
    }
}

/// Drain selection priority.
///
/// Lower values are drained first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DrainPriority {
    /// Node never came up within its boot window.
    Stuck = 0,

    /// Node is idle and past its idle timeout.
    Idle = 1,
}

impl DrainPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stuck => "stuck",
            Self::Idle => "idle",
        }
    }
}

/// Pick up to `count` items to drain.
///
/// `rank` returns `None` for items that must never be drained, otherwise a
/// priority plus a tie-break key; lower sorts first. The sort is stable, so
/// items that tie completely keep their input order.
pub fn select_for_drain<T, K, F>(items: Vec<T>, count: usize, rank: F) -> Vec<(T, DrainPriority)>
where
    K: Ord,
    F: Fn(&T) -> Option<(DrainPriority, K)>,
{
    let mut ranked: Vec<_> = items
        .into_iter()
        .filter_map(|item| rank(&item).map(|(priority, key)| (priority, key, item)))
        .collect();

    ranked.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
    ranked
        .into_iter()
        .take(count)
        .map(|(priority, _, item)| (item, priority))
        .collect()
}

/// Idle tie-break key: longest idle first, then oldest first.
///
/// Sorting ascending on this key yields the drain order the reconciler
/// wants.
pub fn idle_key(idle_for: Duration, age: Duration) -> DrainKey {
    (Reverse(idle_for), Reverse(age))
}

/// Sort key used for every drain candidate.
pub type DrainKey = (Reverse<Duration>, Reverse<Duration>);

/// Default reconciliation interval.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(20);

/// Default create attempts before a boot is declared failed.
pub const DEFAULT_MAX_CREATE_ATTEMPTS: u32 = 3;
