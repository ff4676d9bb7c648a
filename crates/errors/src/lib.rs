use std::borrow::Cow;

/// ErrorMetadata can be attached to an anyhow error chain via
/// `.context(e /* ErrorMetadata */)`. It tags an error with the
/// classification the throttled runner and orchestrator use to decide
/// whether to retry, shrink, or give up.
///
/// `msg` is the developer-facing description. `short_msg` is a stable
/// ScreamingCamelCase tag usable in tests and logs that doesn't change when
/// `msg`'s wording does.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    pub code: ErrorCode,
    pub short_msg: Cow<'static, str>,
    pub msg: Cow<'static, str>,
}

/// Classification of a build error, matching the taxonomy an index build
/// must sort every failure into: the three kinds the throttled runner
/// recovers from locally, and the kinds that always propagate.
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Transient failure (e.g. a commit conflict); retry the same chunk
    /// bounds unchanged.
    RetriableSameChunk,
    /// Transaction exceeded a size/time limit; retry with a smaller chunk.
    RetriableSmallerChunk,
    /// The requested range is already present in the index's range set.
    RangeAlreadyBuilt,
    /// This session's lease was lost to another session.
    SessionLost,
    /// Another live session already holds the lease.
    SessionLocked,
    /// Pre-flight validation failed (e.g. By-Index source index unusable).
    Validation,
    /// The runner exhausted its retry budget without making progress.
    MaxRetriesExceeded,
    /// The index's on-disk lifecycle state didn't match what the caller
    /// required.
    StateMismatch,
}

impl ErrorMetadata {
    pub fn retriable_same_chunk(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::RetriableSameChunk,
            short_msg: "RetriableSameChunk".into(),
            msg: msg.into(),
        }
    }

    pub fn retriable_smaller_chunk(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::RetriableSmallerChunk,
            short_msg: "RetriableSmallerChunk".into(),
            msg: msg.into(),
        }
    }

    pub fn range_already_built(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::RangeAlreadyBuilt,
            short_msg: "RangeAlreadyBuilt".into(),
            msg: msg.into(),
        }
    }

    pub fn session_lost(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::SessionLost,
            short_msg: "SessionLost".into(),
            msg: msg.into(),
        }
    }

    pub fn session_locked(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::SessionLocked,
            short_msg: "SessionLocked".into(),
            msg: msg.into(),
        }
    }

    pub fn validation(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::Validation,
            short_msg: "Validation".into(),
            msg: msg.into(),
        }
    }

    pub fn max_retries_exceeded(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::MaxRetriesExceeded,
            short_msg: "MaxRetriesExceeded".into(),
            msg: msg.into(),
        }
    }

    pub fn state_mismatch(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::StateMismatch,
            short_msg: "StateMismatch".into(),
            msg: msg.into(),
        }
    }

    pub fn is_retriable_same_chunk(&self) -> bool {
        self.code == ErrorCode::RetriableSameChunk
    }

    pub fn is_retriable_smaller_chunk(&self) -> bool {
        self.code == ErrorCode::RetriableSmallerChunk
    }

    pub fn is_range_already_built(&self) -> bool {
        self.code == ErrorCode::RangeAlreadyBuilt
    }

    pub fn is_session_lost(&self) -> bool {
        self.code == ErrorCode::SessionLost
    }

    pub fn is_session_locked(&self) -> bool {
        self.code == ErrorCode::SessionLocked
    }

    pub fn is_validation(&self) -> bool {
        self.code == ErrorCode::Validation
    }

    pub fn is_max_retries_exceeded(&self) -> bool {
        self.code == ErrorCode::MaxRetriesExceeded
    }

    pub fn is_state_mismatch(&self) -> bool {
        self.code == ErrorCode::StateMismatch
    }

    /// True for the two kinds the throttled runner recovers from locally
    /// without the caller ever seeing the error.
    pub fn is_locally_retriable(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::RetriableSameChunk | ErrorCode::RetriableSmallerChunk
        )
    }
}

/// Extension methods for classifying an `anyhow::Error` chain that may or
/// may not carry an attached `ErrorMetadata`, mirroring the single
/// mapping-point idiom used at the storage boundary: errors are classified
/// once, at `StoreTransaction::commit`, and everything downstream asks the
/// chain rather than re-deriving the classification.
pub trait ErrorMetadataAnyhowExt {
    fn is_retriable_same_chunk(&self) -> bool;
    fn is_retriable_smaller_chunk(&self) -> bool;
    fn is_locally_retriable(&self) -> bool;
    fn is_range_already_built(&self) -> bool;
    fn is_session_lost(&self) -> bool;
    fn is_session_locked(&self) -> bool;
    fn is_validation(&self) -> bool;
    fn short_msg(&self) -> &str;
    fn map_error_metadata<F: FnOnce(ErrorMetadata) -> ErrorMetadata>(self, f: F) -> Self;
    fn wrap_error_message<F>(self, f: F) -> Self
    where
        F: FnOnce(String) -> String;
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    fn is_retriable_same_chunk(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(ErrorMetadata::is_retriable_same_chunk)
    }

    fn is_retriable_smaller_chunk(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(ErrorMetadata::is_retriable_smaller_chunk)
    }

    fn is_locally_retriable(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(ErrorMetadata::is_locally_retriable)
    }

    fn is_range_already_built(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(ErrorMetadata::is_range_already_built)
    }

    fn is_session_lost(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(ErrorMetadata::is_session_lost)
    }

    fn is_session_locked(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(ErrorMetadata::is_session_locked)
    }

    fn is_validation(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(ErrorMetadata::is_validation)
    }

    fn short_msg(&self) -> &str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return &e.short_msg;
        }
        INTERNAL_ERROR
    }

    fn map_error_metadata<F>(self, f: F) -> Self
    where
        F: FnOnce(ErrorMetadata) -> ErrorMetadata,
    {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>().cloned() {
            return self.context(f(e));
        }
        self
    }

    fn wrap_error_message<F>(self, f: F) -> Self
    where
        F: FnOnce(String) -> String,
    {
        if let Some(mut em) = self.downcast_ref::<ErrorMetadata>().cloned() {
            em.msg = f(em.msg.to_string()).into();
            return self.context(em);
        }
        let new_msg = f(self.to_string());
        self.context(new_msg)
    }
}

pub const INTERNAL_ERROR: &str = "InternalError";

#[cfg(any(test, feature = "testing"))]
mod arbitrary_impls {
    use proptest::prelude::*;

    use super::{
        ErrorCode,
        ErrorMetadata,
    };

    impl Arbitrary for ErrorMetadata {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with((): Self::Parameters) -> Self::Strategy {
            any::<ErrorCode>()
                .prop_map(|code| match code {
                    ErrorCode::RetriableSameChunk => {
                        ErrorMetadata::retriable_same_chunk("transient")
                    },
                    ErrorCode::RetriableSmallerChunk => {
                        ErrorMetadata::retriable_smaller_chunk("too large")
                    },
                    ErrorCode::RangeAlreadyBuilt => {
                        ErrorMetadata::range_already_built("already built")
                    },
                    ErrorCode::SessionLost => ErrorMetadata::session_lost("lost"),
                    ErrorCode::SessionLocked => ErrorMetadata::session_locked("locked"),
                    ErrorCode::Validation => ErrorMetadata::validation("invalid"),
                    ErrorCode::MaxRetriesExceeded => {
                        ErrorMetadata::max_retries_exceeded("exhausted")
                    },
                    ErrorCode::StateMismatch => ErrorMetadata::state_mismatch("mismatch"),
                })
                .boxed()
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::{
        ErrorCode,
        ErrorMetadata,
        ErrorMetadataAnyhowExt,
    };

    #[test]
    fn anyhow_classification_roundtrips() {
        let err = anyhow::Error::new(ErrorMetadata::retriable_smaller_chunk("too big"));
        assert!(err.is_retriable_smaller_chunk());
        assert!(err.is_locally_retriable());
        assert!(!err.is_session_lost());
        assert_eq!(err.short_msg(), "RetriableSmallerChunk");
    }

    #[test]
    fn plain_anyhow_error_is_not_classified() {
        let err = anyhow::anyhow!("boom");
        assert!(!err.is_locally_retriable());
        assert_eq!(err.short_msg(), super::INTERNAL_ERROR);
    }

    proptest! {
        #![proptest_config(ProptestConfig { failure_persistence: None, ..ProptestConfig::default() })]

        #[test]
        fn locally_retriable_iff_same_or_smaller_chunk(code in any::<ErrorCode>()) {
            let locally_retriable = matches!(
                code,
                ErrorCode::RetriableSameChunk | ErrorCode::RetriableSmallerChunk
            );
            let em = ErrorMetadata { code, short_msg: "x".into(), msg: "y".into() };
            prop_assert_eq!(em.is_locally_retriable(), locally_retriable);
        }
    }
}
