//! Result codes shared by the mixer, the data pipes and the effects

use thiserror::Error;

/// Failure codes returned by control-plane operations.
///
/// Success is `Ok(..)`; every other outcome maps onto one of these variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum MixerError {
    #[error("generic error")]
    Error,
    #[error("invalid handle")]
    InvalidHandle,
    #[error("operation is not allowed in the current state")]
    IllegalState,
    #[error("illegal argument")]
    IllegalArgument,
    #[error("internal error")]
    InternalError,
    #[error("memory allocation failed")]
    MemoryAllocationFailed,
    #[error("resource allocation failed")]
    ResourceAllocationFailed,
    #[error("control lost")]
    ControlLost,
    #[error("dead object")]
    DeadObject,
}

impl MixerError {
    /// Stable integer result code (success is 0)
    pub fn code(self) -> i32 {
        match self {
            MixerError::Error => -1,
            MixerError::InvalidHandle => -2,
            MixerError::IllegalState => -3,
            MixerError::IllegalArgument => -4,
            MixerError::InternalError => -5,
            MixerError::MemoryAllocationFailed => -6,
            MixerError::ResourceAllocationFailed => -7,
            MixerError::ControlLost => -8,
            MixerError::DeadObject => -9,
        }
    }
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, MixerError>;

/// Collapse a result into its integer code
pub fn result_code<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct() {
        let all = [
            MixerError::Error,
            MixerError::InvalidHandle,
            MixerError::IllegalState,
            MixerError::IllegalArgument,
            MixerError::InternalError,
            MixerError::MemoryAllocationFailed,
            MixerError::ResourceAllocationFailed,
            MixerError::ControlLost,
            MixerError::DeadObject,
        ];
        for (i, a) in all.iter().enumerate() {
            assert!(a.code() < 0);
            for b in &all[i + 1..] {
                assert_ne!(a.code(), b.code());
            }
        }
    }

    #[test]
    fn test_result_code() {
        assert_eq!(result_code(&Ok::<(), MixerError>(())), 0);
        assert_eq!(result_code::<()>(&Err(MixerError::ControlLost)), -8);
    }
}
