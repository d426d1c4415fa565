//! Macros for sync error handling.
//!
//! Convenience macros for creating and returning [`crate::error::SyncError`]
//! instances with reduced boilerplate.

/// Creates a [`crate::error::SyncError`] from error kind and description.
#[macro_export]
macro_rules! sync_error {
    ($kind:expr, $desc:expr) => {
        SyncError::from(($kind, $desc))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        SyncError::from(($kind, $desc, $detail.to_string()))
    };
}

/// Creates and returns a [`crate::error::SyncError`] from the current function.
#[macro_export]
macro_rules! bail {
    ($kind:expr, $desc:expr) => {
        return Err($crate::sync_error!($kind, $desc))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        return Err($crate::sync_error!($kind, $desc, $detail))
    };
}
