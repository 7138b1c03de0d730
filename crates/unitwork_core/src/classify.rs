//! Failure classification for atomic blocks.
//!
//! # Responsibility
//! - Map a normalized failure descriptor to one stable classification.
//! - Keep the atomic wrapper independent from any driver's error hierarchy.
//!
//! # Invariants
//! - Classification is pure: no I/O, no rollback, no shared state.
//! - Rules are evaluated in order and the first match wins.
//! - Only driver-originated failures can be classified as conflicts.

/// SQLSTATE reported for a lock-wait cycle.
pub const SQLSTATE_DEADLOCK_DETECTED: &str = "40P01";
/// SQLSTATE reported when a serializable/snapshot check fails.
pub const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";

/// Outcome of classifying one failure raised inside an atomic block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClassification {
    /// Not a recognized conflict pattern.
    Generic,
    /// Lock-wait cycle between concurrent transactions.
    StructuralConflict,
    /// Serialization/consistency check failure; the block may be retried.
    TransientConflict,
}

impl ErrorClassification {
    /// Stable lowercase label used in log events.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Generic => "generic",
            Self::StructuralConflict => "structural_conflict",
            Self::TransientConflict => "transient_conflict",
        }
    }
}

/// Where a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureOrigin {
    /// Reported by the database driver.
    Driver,
    /// Raised by application code running inside the block.
    Application,
    /// The block's future was dropped before it finished.
    Cancelled,
}

/// Driver-independent description of a failure.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FailureDescriptor {
    pub origin: FailureOrigin,
    /// SQLSTATE-style code when the driver reported one.
    pub code: Option<String>,
}

impl FailureDescriptor {
    pub fn driver(code: Option<&str>) -> Self {
        Self {
            origin: FailureOrigin::Driver,
            code: code.map(str::to_string),
        }
    }

    pub fn application() -> Self {
        Self {
            origin: FailureOrigin::Application,
            code: None,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            origin: FailureOrigin::Cancelled,
            code: None,
        }
    }
}

/// Classifies one failure.
///
/// # Contract
/// - Driver failure with `40P01` -> `StructuralConflict`.
/// - Driver failure with `40001` -> `TransientConflict`.
/// - Everything else, including application errors that happen to carry a
///   conflict code, -> `Generic`.
pub fn classify(descriptor: &FailureDescriptor) -> ErrorClassification {
    if descriptor.origin != FailureOrigin::Driver {
        return ErrorClassification::Generic;
    }

    match descriptor.code.as_deref() {
        Some(SQLSTATE_DEADLOCK_DETECTED) => ErrorClassification::StructuralConflict,
        Some(SQLSTATE_SERIALIZATION_FAILURE) => ErrorClassification::TransientConflict,
        _ => ErrorClassification::Generic,
    }
}

#[cfg(test)]
mod tests {
    use super::{
        classify, ErrorClassification, FailureDescriptor, FailureOrigin,
        SQLSTATE_DEADLOCK_DETECTED, SQLSTATE_SERIALIZATION_FAILURE,
    };

    #[test]
    fn deadlock_code_is_structural_conflict() {
        let descriptor = FailureDescriptor::driver(Some(SQLSTATE_DEADLOCK_DETECTED));
        assert_eq!(
            classify(&descriptor),
            ErrorClassification::StructuralConflict
        );
    }

    #[test]
    fn serialization_code_is_transient_conflict() {
        let descriptor = FailureDescriptor::driver(Some(SQLSTATE_SERIALIZATION_FAILURE));
        assert_eq!(
            classify(&descriptor),
            ErrorClassification::TransientConflict
        );
    }

    #[test]
    fn unknown_or_missing_driver_code_is_generic() {
        assert_eq!(
            classify(&FailureDescriptor::driver(Some("23505"))),
            ErrorClassification::Generic
        );
        assert_eq!(
            classify(&FailureDescriptor::driver(None)),
            ErrorClassification::Generic
        );
    }

    #[test]
    fn non_driver_origins_are_generic_even_with_conflict_codes() {
        for origin in [FailureOrigin::Application, FailureOrigin::Cancelled] {
            let descriptor = FailureDescriptor {
                origin,
                code: Some(SQLSTATE_DEADLOCK_DETECTED.to_string()),
            };
            assert_eq!(classify(&descriptor), ErrorClassification::Generic);
        }
    }

    #[test]
    fn labels_are_stable() {
        assert_eq!(ErrorClassification::Generic.as_str(), "generic");
        assert_eq!(
            ErrorClassification::StructuralConflict.as_str(),
            "structural_conflict"
        );
        assert_eq!(
            ErrorClassification::TransientConflict.as_str(),
            "transient_conflict"
        );
    }
}
