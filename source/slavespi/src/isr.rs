//! Tracking whether we are running inside a bus hook.
//!
//! Bus drivers invoke [`TransactionHooks`](crate::TransactionHooks) from
//! their interrupt handler. Wrapping that call in an [`Isr`] guard lets the
//! rest of the crate check, in debug builds, that hot-path code only runs
//! where it is expected to and that blocking APIs are kept out of it.

use portable_atomic::{AtomicU8, Ordering};

static DEPTH: AtomicU8 = AtomicU8::new(0);

/// Guard marking the current context as an interrupt handler.
///
/// Guards nest: a hook that triggers another hook (for example, a resubmit
/// that immediately reports "queued") simply raises the depth.
#[derive(Debug)]
pub struct Isr(());

impl Isr {
    #[must_use]
    #[inline]
    pub fn enter() -> Self {
        DEPTH.fetch_add(1, Ordering::Release);
        Self(())
    }

    /// Run `f` as a bus hook would be run: inside an [`Isr`] guard.
    ///
    /// Bus drivers wrap every [`TransactionHooks`](crate::TransactionHooks)
    /// call in this.
    #[inline]
    pub fn run<R>(f: impl FnOnce() -> R) -> R {
        let _isr = Self::enter();
        f()
    }

    #[must_use]
    #[inline]
    pub fn is_in_isr() -> bool {
        DEPTH.load(Ordering::Acquire) > 0
    }
}

impl Drop for Isr {
    fn drop(&mut self) {
        DEPTH.fetch_sub(1, Ordering::Release);
    }
}
