//! A generic error-classification object that can be attached to an `anyhow`
//! error chain via `.context(e /* ErrorMetadata */)`.
//!
//! This mirrors the taxonomy from the shard engine's error handling design:
//! `InvalidParams`, `NotFound`, `Transient`, `Internal`, `InvariantViolation`,
//! `LoadLimitHit`. Attach one of these near the throw site; callers downstream
//! inspect it via `ErrorMetadataAnyhowExt` without needing to know the
//! concrete error type that produced it.

use std::borrow::Cow;

#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    pub code: ErrorCode,
    /// short ScreamingCamelCase, usable in tests for string matching.
    /// e.g. `RefcountBelowOne`.
    pub short_msg: Cow<'static, str>,
    /// human readable, developer facing.
    pub msg: Cow<'static, str>,
}

#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Malformed request: shard closed on lookup, malformed page token, etc.
    /// Callers must not retry.
    InvalidParams,
    /// Series not present. Only surfaced internally; swallowed at the
    /// external-facing boundary (§7).
    NotFound,
    /// Insert queue full, rate-limit throttled. Returned to the caller for
    /// backoff.
    Transient,
    /// Queue insert failure, write failure, and other unexpected internal
    /// errors. Counted in metrics and returned.
    Internal,
    /// Refcount < 1 at purge time, or a lease-manager update failed.
    /// Logged at error with full context in addition to being returned.
    InvariantViolation,
    /// A bootstrap/repair load exceeded its memory budget. Distinct from
    /// `Internal` so callers can degrade to a slower path instead of failing
    /// outright.
    LoadLimitHit,
}

impl ErrorMetadata {
    pub fn invalid_params(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::InvalidParams,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn not_found(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::NotFound,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn transient(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Transient,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn internal(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Internal,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn invariant_violation(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::InvariantViolation,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn load_limit_hit(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::LoadLimitHit,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn is_invalid_params(&self) -> bool {
        self.code == ErrorCode::InvalidParams
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::NotFound
    }

    pub fn is_transient(&self) -> bool {
        self.code == ErrorCode::Transient
    }

    pub fn is_internal(&self) -> bool {
        self.code == ErrorCode::Internal
    }

    pub fn is_invariant_violation(&self) -> bool {
        self.code == ErrorCode::InvariantViolation
    }

    pub fn is_load_limit_hit(&self) -> bool {
        self.code == ErrorCode::LoadLimitHit
    }
}

pub trait ErrorMetadataAnyhowExt {
    fn is_invalid_params(&self) -> bool;
    fn is_not_found(&self) -> bool;
    fn is_transient(&self) -> bool;
    fn is_internal(&self) -> bool;
    fn is_invariant_violation(&self) -> bool;
    fn is_load_limit_hit(&self) -> bool;
    fn short_msg(&self) -> &str;
    fn msg(&self) -> &str;
    fn map_error_metadata<F: FnOnce(ErrorMetadata) -> ErrorMetadata>(self, f: F) -> Self;
    fn wrap_error_message<F>(self, f: F) -> Self
    where
        F: FnOnce(String) -> String;
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    fn is_invalid_params(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(ErrorMetadata::is_invalid_params)
    }

    fn is_not_found(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(ErrorMetadata::is_not_found)
    }

    fn is_transient(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(ErrorMetadata::is_transient)
    }

    fn is_internal(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(ErrorMetadata::is_internal)
    }

    fn is_invariant_violation(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(ErrorMetadata::is_invariant_violation)
    }

    fn is_load_limit_hit(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(ErrorMetadata::is_load_limit_hit)
    }

    fn short_msg(&self) -> &str {
        self.downcast_ref::<ErrorMetadata>()
            .map(|e| &*e.short_msg)
            .unwrap_or(INTERNAL_ERROR)
    }

    fn msg(&self) -> &str {
        self.downcast_ref::<ErrorMetadata>()
            .map(|e| &*e.msg)
            .unwrap_or(INTERNAL_ERROR_MSG)
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
pub const INTERNAL_ERROR_MSG: &str = "An internal error occurred. Please retry.";

/// Log an invariant violation with full context. Per the error handling
/// design, these are always surfaced at error level even though the caller
/// also sees the returned error -- operability depends on the log line, not
/// just the return value.
pub fn report_invariant_violation(err: &anyhow::Error) {
    tracing::error!("invariant violation: {err:#}");
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::{
        ErrorCode,
        ErrorMetadata,
        ErrorMetadataAnyhowExt,
    };

    proptest! {
        #![proptest_config(ProptestConfig { failure_persistence: None, ..ProptestConfig::default() })]

        #[test]
        fn code_roundtrips_through_anyhow(code in any::<ErrorCode>()) {
            let em = ErrorMetadata { code, short_msg: "Short".into(), msg: "Long form".into() };
            let err = anyhow::Error::new(em.clone());
            prop_assert_eq!(err.downcast_ref::<ErrorMetadata>().unwrap().code, code);
            prop_assert_eq!(err.short_msg(), "Short");
        }

        #[test]
        fn wrap_error_message_preserves_code(code in any::<ErrorCode>()) {
            let em = ErrorMetadata { code, short_msg: "Short".into(), msg: "Long form".into() };
            let err = anyhow::Error::new(em).wrap_error_message(|m| format!("wrapped: {m}"));
            prop_assert!(err.downcast_ref::<ErrorMetadata>().is_some());
            prop_assert_eq!(err.downcast_ref::<ErrorMetadata>().unwrap().code, code);
        }
    }
}
