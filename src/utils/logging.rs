//! Conditional logging macros that check a module-level `ENABLE_LOGS` flag.
//!
//! The per-frame loops (capture, inference, MJPEG preview) log a line per
//! frame when debugging; flipping their flag silences them without touching
//! call sites.
//!
//! Usage:
//! ```rust,ignore
//! // In your module, define the flag first:
//! const ENABLE_LOGS: bool = true;
//!
//! // Then use the macro (it's exported at the crate root):
//! use crate::log_debug;
//!
//! log_debug!("This will log if ENABLE_LOGS is true");
//! ```

/// Macro for conditional debug logging.
/// Checks the `ENABLE_LOGS` const in the calling module.
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::debug!($($arg)*);
        }
    };
}
