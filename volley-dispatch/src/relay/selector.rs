//! Round-robin relay choice with skip-on-disabled.

use std::sync::Arc;

use super::{RelayEntry, RelayPool};

/// The relay after `current` in a pool of `pool_size`.
#[must_use]
pub const fn next(current: usize, pool_size: usize) -> usize {
    if pool_size == 0 {
        0
    } else {
        (current + 1) % pool_size
    }
}

/// Outcome of [`select_for_attempt`]
#[derive(Debug, Clone)]
pub enum Selection {
    Relay {
        entry: Arc<RelayEntry>,
        index: usize,
    },
    /// No usable relay within the allowed number of steps
    Exhausted,
}

/// Walks forward from `start`, skipping disabled relays, for at most
/// `max_steps` relays.
///
/// Always terminates: with every relay disabled the walk runs out of steps
/// and reports [`Selection::Exhausted`].
#[must_use]
pub fn select_for_attempt(pool: &RelayPool, start: usize, max_steps: usize) -> Selection {
    let size = pool.len();
    if size == 0 {
        return Selection::Exhausted;
    }

    let mut index = start % size;
    for _ in 0..max_steps {
        if let Some(entry) = pool.get(index).filter(|entry| !entry.is_disabled()) {
            return Selection::Relay {
                entry: Arc::clone(entry),
                index,
            };
        }
        index = next(index, size);
    }

    Selection::Exhausted
}
