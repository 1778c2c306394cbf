//! Read-failure backoff: how far to jump forward after a read error.
//!
//! Skipping trades completeness for progress: sectors inside a jump are never
//! verified.  The engine therefore logs every jump and flags the run with a
//! read error even when it finishes.
//!
//! All skips are multiples of the *boundary*: the largest power of two not
//! above 4096 that still fits in one block.
//!
//! | Selector | Strategy | Growth |
//! |----------|----------|--------|
//! | 0 | `Disabled` | first read error ends the run |
//! | 1 | `Fixed` | always one boundary |
//! | 2 | `AccumulateContiguous` | +1 boundary while each failure is exactly where the last jump landed |
//! | 3 | `AccumulateStalled` | +1 boundary while failures do not get past the previous failure |
//! | 4 | `Doubling` | ×2 every failure; restart from ½ boundary after a discontinuity |
//! | 5 | `DoublingWithReset` | ×2 on a repeat at the same position, else one boundary |

use serde::Serialize;

/// Largest boundary; halved until it fits the block size.
pub const DEFAULT_BOUNDARY: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum JumpMode {
    #[default]
    Disabled,
    Fixed,
    AccumulateContiguous,
    AccumulateStalled,
    Doubling,
    DoublingWithReset,
}

impl JumpMode {
    /// Map the numeric CLI selector.
    pub fn from_selector(n: u8) -> Option<Self> {
        match n {
            0 => Some(JumpMode::Disabled),
            1 => Some(JumpMode::Fixed),
            2 => Some(JumpMode::AccumulateContiguous),
            3 => Some(JumpMode::AccumulateStalled),
            4 => Some(JumpMode::Doubling),
            5 => Some(JumpMode::DoublingWithReset),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            JumpMode::Disabled             => "disabled",
            JumpMode::Fixed                => "fixed",
            JumpMode::AccumulateContiguous => "accumulate-if-contiguous",
            JumpMode::AccumulateStalled    => "accumulate-if-stalled",
            JumpMode::Doubling             => "doubling",
            JumpMode::DoublingWithReset    => "doubling-with-reset",
        }
    }
}

/// Skip granularity for a block size.
pub fn boundary_for(block_size: usize) -> u64 {
    let mut b = DEFAULT_BOUNDARY;
    while b > 1 && b > block_size as u64 {
        b /= 2;
    }
    b
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackoffState {
    /// Where the last jump landed; a failure exactly here is back-to-back.
    pub next_retry_boundary: u64,
    /// Size of the last jump.
    pub skip_amount:         u64,
    /// Position of the last failure, `None` before the first one.
    pub last_failure:        Option<u64>,
}

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    mode:     JumpMode,
    boundary: u64,
    state:    BackoffState,
}

impl BackoffPolicy {
    pub fn new(mode: JumpMode, block_size: usize) -> Self {
        Self { mode, boundary: boundary_for(block_size), state: BackoffState::default() }
    }

    pub fn mode(&self) -> JumpMode {
        self.mode
    }

    pub fn boundary(&self) -> u64 {
        self.boundary
    }

    pub fn state(&self) -> &BackoffState {
        &self.state
    }

    /// Record a read failure at `position` and return how many bytes to skip.
    ///
    /// `None` means no further retry: the strategy is disabled or the jump
    /// would overflow the address space.
    pub fn on_failure(&mut self, position: u64) -> Option<u64> {
        let b  = self.boundary;
        let st = &self.state;

        let first  = st.last_failure.is_none();
        let landed = !first && position == st.next_retry_boundary;
        let repeat = st.last_failure == Some(position);
        let stalled = st.last_failure.map_or(false, |last| position <= last);

        let skip = match self.mode {
            JumpMode::Disabled => return None,
            JumpMode::Fixed => b,
            JumpMode::AccumulateContiguous => {
                if landed { st.skip_amount.checked_add(b)? } else { b }
            }
            JumpMode::AccumulateStalled => {
                if stalled { st.skip_amount.checked_add(b)? } else { b }
            }
            JumpMode::Doubling => {
                let base = if first || position > st.next_retry_boundary {
                    b / 2
                } else {
                    st.skip_amount
                };
                base.checked_mul(2)?
            }
            JumpMode::DoublingWithReset => {
                if repeat { st.skip_amount.checked_mul(2)? } else { b }
            }
        };

        let skip = (skip / b).max(1) * b;
        let landing = position.checked_add(skip)?;
        self.state = BackoffState {
            next_retry_boundary: landing,
            skip_amount:         skip,
            last_failure:        Some(position),
        };
        Some(skip)
    }
}
