use thiserror::Error;

/// Top-level error type for marionet.
#[derive(Debug, Error)]
pub enum MarionetError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

/// Structural problems detected by the solvers' pre-flight validation.
///
/// Copy + static messages for cheap propagation in hot paths. These are
/// reported through the warning channel rather than thrown; a solver with a
/// structural problem skips solving for the frame instead of corrupting the
/// pose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Chain contains no bones")]
    NoBones,

    #[error("Chain needs at least {min} bones, got {got}")]
    ChainTooShort { min: usize, got: usize },

    #[error("Zero length bone at chain index {index}")]
    ZeroLengthBone { index: usize },

    #[error("Bone is referenced by more than one chain")]
    DuplicateBone,

    #[error("Solver contains no chains")]
    NoChains,

    #[error("Chain child index out of range: {index} >= {count}")]
    ChildIndexOutOfRange { index: usize, count: usize },

    #[error("Chain child tree is not connected to the root chain")]
    DisconnectedChain,

    #[error("Node reference points outside the solver's chains")]
    NodeOutsideSolver,

    #[error("Solver has not been initiated")]
    NotInitiated,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marionet_error_from_validation_error() {
        let err = ValidationError::ChainTooShort { min: 2, got: 1 };
        let top: MarionetError = err.into();
        assert!(matches!(top, MarionetError::Validation(_)));
        assert!(top.to_string().contains("at least 2"));
    }

    #[test]
    fn validation_error_is_copy() {
        let err = ValidationError::NoBones;
        let err2 = err; // Copy
        assert_eq!(err, err2);
    }

    #[test]
    fn validation_error_display_messages() {
        assert_eq!(ValidationError::NoBones.to_string(), "Chain contains no bones");
        assert_eq!(
            ValidationError::ChainTooShort { min: 3, got: 2 }.to_string(),
            "Chain needs at least 3 bones, got 2"
        );
        assert_eq!(
            ValidationError::ZeroLengthBone { index: 1 }.to_string(),
            "Zero length bone at chain index 1"
        );
        assert_eq!(
            ValidationError::ChildIndexOutOfRange { index: 5, count: 3 }.to_string(),
            "Chain child index out of range: 5 >= 3"
        );
        assert_eq!(
            ValidationError::NotInitiated.to_string(),
            "Solver has not been initiated"
        );
    }
}
