//! Process-wide cooperative cancellation.
//!
//! The flag is the only process-global state beside the engine itself. The
//! CLI's signal handler calls [`request`]; workers poll at every loop
//! iteration and phase bodies poll at their suspension points. External
//! runners check it at their own cancellation points.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;

use crate::core::errors::EnvyError;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Requests cooperative shutdown of every engine in the process.
pub fn request() {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

pub fn is_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

/// Clears the flag; explicit teardown between engine runs (and tests).
pub fn reset() {
    SHUTDOWN.store(false, Ordering::SeqCst);
}

/// Fails with [`EnvyError::Cancelled`] if shutdown was requested.
pub fn check() -> Result<()> {
    if is_requested() {
        Err(EnvyError::Cancelled.into())
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_check_reset() {
        reset();
        assert!(check().is_ok());
        request();
        assert!(is_requested());
        let err = check().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EnvyError>(),
            Some(EnvyError::Cancelled)
        ));
        reset();
        assert!(check().is_ok());
    }
}
