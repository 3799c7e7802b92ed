//! Shared cooperative-cancellation flag.
//!
//! A single byte shared between the coordinator's async context and the
//! engine thread. It is the only mutable memory the two sides share; all
//! other communication goes through the message channels.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::{Error, Result};

/// Flag value meaning "run normally".
pub const INTERRUPT_CLEAR: u8 = 0;

/// Sentinel meaning "raise an interruption at the next checkpoint".
///
/// The value matches SIGINT so runtimes that map the byte to a signal
/// number can use it unchanged.
pub const INTERRUPT_SIGINT: u8 = 2;

/// Shared one-byte flag for cooperative cancellation of script execution.
///
/// `InterruptFlag` can be cloned and shared across threads; any clone can
/// raise the flag and all clones observe it. Cancellation is cooperative:
/// the runtime must call [`InterruptFlag::check`] (usually through
/// [`RuntimeIo::check_interrupt`](crate::runtime::RuntimeIo::check_interrupt))
/// at its checkpoints, so already-running native work between checkpoints
/// cannot be preempted.
///
/// # Example
///
/// ```
/// use runbridge::InterruptFlag;
///
/// let flag = InterruptFlag::new();
/// let shared = flag.clone();
///
/// assert!(!flag.is_raised());
/// shared.raise();
/// assert!(flag.is_raised());
/// assert!(flag.check().is_err());
///
/// flag.clear();
/// assert!(flag.check().is_ok());
/// ```
#[derive(Clone, Debug, Default)]
pub struct InterruptFlag {
    /// The shared byte.
    cell: Arc<AtomicU8>,
}

impl InterruptFlag {
    /// Create a new, cleared flag.
    pub fn new() -> Self {
        Self {
            cell: Arc::new(AtomicU8::new(INTERRUPT_CLEAR)),
        }
    }

    /// Request cancellation at the runtime's next checkpoint.
    pub fn raise(&self) {
        self.cell.store(INTERRUPT_SIGINT, Ordering::Relaxed);
    }

    /// Reset the flag. Called before starting a new execution so a stale
    /// interrupt cannot cancel it.
    pub fn clear(&self) {
        self.cell.store(INTERRUPT_CLEAR, Ordering::Relaxed);
    }

    /// Check whether cancellation has been requested.
    pub fn is_raised(&self) -> bool {
        self.cell.load(Ordering::Relaxed) != INTERRUPT_CLEAR
    }

    /// Cooperative checkpoint: returns [`Error::Interrupted`] once the
    /// flag has been raised.
    pub fn check(&self) -> Result<()> {
        if self.is_raised() {
            Err(Error::Interrupted)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_is_visible_to_all_clones() {
        let flag = InterruptFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_raised());

        flag.raise();
        assert!(clone.is_raised());
        assert!(clone.check().unwrap_err().is_interrupted());
    }

    #[test]
    fn clear_rearms_the_flag() {
        let flag = InterruptFlag::new();
        flag.raise();
        flag.clear();
        assert!(!flag.is_raised());
        assert!(flag.check().is_ok());
    }

    #[test]
    fn raise_is_idempotent() {
        let flag = InterruptFlag::new();
        flag.raise();
        flag.raise();
        assert!(flag.is_raised());
    }
}
