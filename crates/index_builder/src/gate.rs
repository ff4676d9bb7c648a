use errors::ErrorMetadata;
use store_api::IndexLifecycle;

use crate::config::IndexStatePrecondition;

/// What the orchestrator should do at start-of-build, decided once against
/// the persisted lifecycle state. Grounded on the teacher's
/// `DatabaseIndexState` match arms in `index_worker.rs`'s
/// `begin_backfill`/`finish_backfill`: match on-disk state, bail with a
/// descriptive error on anything unexpected.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GateDecision {
    /// Transition to `WriteOnly`, clearing existing index data first if
    /// requested, then build.
    Build { clear: bool },
    /// Resume building without clearing.
    Continue,
    /// Clear and build from scratch, without an explicit lifecycle
    /// transition (the index is already `WriteOnly` or `Readable`).
    Rebuild,
    /// Nothing to do; exit successfully with the given reason.
    NoOp(&'static str),
    /// Refuse to build.
    Fail,
}

/// Evaluate the precondition table in against the persisted lifecycle
/// state.
pub fn evaluate(precondition: IndexStatePrecondition, state: IndexLifecycle) -> GateDecision {
    use IndexLifecycle::*;
    use IndexStatePrecondition::*;

    match (precondition, state) {
        (BuildIfDisabled, Disabled) => GateDecision::Build { clear: true },
        (BuildIfDisabled, WriteOnly) => GateDecision::NoOp("index is already being built"),
        (BuildIfDisabled, Readable) => GateDecision::NoOp("index is already readable"),
        (BuildIfDisabled, Corrupt) => GateDecision::Fail,

        (BuildIfDisabledContinueIfWriteOnly, Disabled) => GateDecision::Build { clear: true },
        (BuildIfDisabledContinueIfWriteOnly, WriteOnly) => GateDecision::Continue,
        (BuildIfDisabledContinueIfWriteOnly, Readable) => GateDecision::NoOp("index is already readable"),
        (BuildIfDisabledContinueIfWriteOnly, Corrupt) => GateDecision::Fail,

        (BuildIfDisabledRebuildIfWriteOnly, Disabled) => GateDecision::Build { clear: true },
        (BuildIfDisabledRebuildIfWriteOnly, WriteOnly) => GateDecision::Rebuild,
        (BuildIfDisabledRebuildIfWriteOnly, Readable) => GateDecision::NoOp("index is already readable"),
        (BuildIfDisabledRebuildIfWriteOnly, Corrupt) => GateDecision::Fail,

        (ForceBuild, Disabled) => GateDecision::Build { clear: true },
        (ForceBuild, WriteOnly) => GateDecision::Rebuild,
        (ForceBuild, Readable) => GateDecision::Build { clear: true },
        (ForceBuild, Corrupt) => GateDecision::Fail,

        (ErrorIfDisabledContinueIfWriteOnly, Disabled) => GateDecision::Fail,
        (ErrorIfDisabledContinueIfWriteOnly, WriteOnly) => GateDecision::Continue,
        (ErrorIfDisabledContinueIfWriteOnly, Readable) => GateDecision::NoOp("index is already readable"),
        (ErrorIfDisabledContinueIfWriteOnly, Corrupt) => GateDecision::Fail,
    }
}

pub fn gate_error(precondition: IndexStatePrecondition, state: IndexLifecycle) -> anyhow::Error {
    ErrorMetadata::state_mismatch(format!(
        "cannot build with precondition {precondition:?} while index is {state}"
    ))
    .into()
}

#[cfg(test)]
mod tests {
    use store_api::IndexLifecycle::*;

    use super::*;
    use crate::config::IndexStatePrecondition::*;

    #[test]
    fn force_build_always_proceeds() {
        for state in [Disabled, WriteOnly, Readable] {
            assert_ne!(evaluate(ForceBuild, state), GateDecision::Fail);
            assert_ne!(evaluate(ForceBuild, state), GateDecision::NoOp("n/a"));
        }
        assert_eq!(evaluate(ForceBuild, Corrupt), GateDecision::Fail);
    }

    #[test]
    fn error_if_disabled_fails_on_disabled() {
        assert_eq!(
            evaluate(ErrorIfDisabledContinueIfWriteOnly, Disabled),
            GateDecision::Fail
        );
        assert_eq!(
            evaluate(ErrorIfDisabledContinueIfWriteOnly, WriteOnly),
            GateDecision::Continue
        );
    }

    #[test]
    fn readable_is_a_no_op_except_for_force_build() {
        assert!(matches!(
            evaluate(BuildIfDisabled, Readable),
            GateDecision::NoOp(_)
        ));
        assert!(matches!(
            evaluate(BuildIfDisabledContinueIfWriteOnly, Readable),
            GateDecision::NoOp(_)
        ));
        assert_eq!(evaluate(ForceBuild, Readable), GateDecision::Build { clear: true });
    }

    #[test]
    fn corrupt_always_fails() {
        for precondition in [
            BuildIfDisabled,
            BuildIfDisabledContinueIfWriteOnly,
            BuildIfDisabledRebuildIfWriteOnly,
            ForceBuild,
            ErrorIfDisabledContinueIfWriteOnly,
        ] {
            assert_eq!(evaluate(precondition, Corrupt), GateDecision::Fail);
        }
    }
}
