use thiserror::Error;
use tracing::error;

use crate::persist;

/// Errors raised by channel, negotiation and routing operations.
///
/// Every variant has a stable numeric code so that it survives the trip
/// through the peer RPC transport and can be re-raised on the caller's side
/// with the same kind.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The peer refused the proposed channel, or the ledger rejected the anchor
    #[error("negotiation rejected: {0}")]
    NegotiationRejected(String),
    /// A counter-signature did not verify against the peer's funding key
    #[error("signature mismatch: {0}")]
    SignatureMismatch(String),
    /// A local payment or update would drive one side below zero
    #[error("balance exceeded: {0}")]
    BalanceExceeded(String),
    /// A proposed split does not add up to the spendable channel value
    #[error("invalid split: {0}")]
    InvalidSplit(String),
    /// No routing entry exists for the destination
    #[error("unknown route: {0}")]
    UnknownRoute(String),
    /// No open channel toward the next hop can carry the amount
    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),
    /// The peer could not be reached, or the response was lost
    #[error("network failure: {0}")]
    NetworkFailure(String),
    /// The peer did not answer within the configured deadline
    #[error("protocol timeout: {0}")]
    ProtocolTimeout(String),
    /// The peer sent a message that is inconsistent with the channel state
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// A forwarded payment ran out of hops before reaching its destination
    #[error("hop limit exceeded: {0}")]
    HopLimitExceeded(String),
    /// The channel id is not known to this node
    #[error("unknown channel: {0}")]
    UnknownChannel(String),
    /// The channel is not in a status that permits the operation
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// The ledger refused to fund, sign or broadcast a transaction
    #[error("ledger rejected: {0}")]
    LedgerRejected(String),
    /// Durable storage failed
    #[error("persist: {0}")]
    Persist(String),
    /// Non-recoverable internal error
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result alias used throughout the crate
pub type Result<T> = core::result::Result<T, Error>;

// Codes live in the implementation-defined JSON-RPC server error range.
const CODE_BASE: i32 = -32100;

impl Error {
    /// The numeric code used to carry this error across the peer transport.
    pub fn code(&self) -> i32 {
        let offset = match self {
            Error::NegotiationRejected(_) => 0,
            Error::SignatureMismatch(_) => 1,
            Error::BalanceExceeded(_) => 2,
            Error::InvalidSplit(_) => 3,
            Error::UnknownRoute(_) => 4,
            Error::InsufficientBalance(_) => 5,
            Error::NetworkFailure(_) => 6,
            Error::ProtocolTimeout(_) => 7,
            Error::ProtocolViolation(_) => 8,
            Error::HopLimitExceeded(_) => 9,
            Error::UnknownChannel(_) => 10,
            Error::InvalidState(_) => 11,
            Error::LedgerRejected(_) => 12,
            Error::Persist(_) => 13,
            Error::Internal(_) => 14,
        };
        CODE_BASE - offset
    }

    /// Rebuild an error from its transport code.
    ///
    /// Unknown codes become [`Error::Internal`] so that no remote failure is
    /// silently dropped.
    pub fn from_code(code: i32, message: impl Into<String>) -> Error {
        let message = message.into();
        match CODE_BASE - code {
            0 => Error::NegotiationRejected(message),
            1 => Error::SignatureMismatch(message),
            2 => Error::BalanceExceeded(message),
            3 => Error::InvalidSplit(message),
            4 => Error::UnknownRoute(message),
            5 => Error::InsufficientBalance(message),
            6 => Error::NetworkFailure(message),
            7 => Error::ProtocolTimeout(message),
            8 => Error::ProtocolViolation(message),
            9 => Error::HopLimitExceeded(message),
            10 => Error::UnknownChannel(message),
            11 => Error::InvalidState(message),
            12 => Error::LedgerRejected(message),
            13 => Error::Persist(message),
            14 => Error::Internal(message),
            _ => Error::Internal(format!("code {}: {}", code, message)),
        }
    }

    /// The detail message, without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            Error::NegotiationRejected(m)
            | Error::SignatureMismatch(m)
            | Error::BalanceExceeded(m)
            | Error::InvalidSplit(m)
            | Error::UnknownRoute(m)
            | Error::InsufficientBalance(m)
            | Error::NetworkFailure(m)
            | Error::ProtocolTimeout(m)
            | Error::ProtocolViolation(m)
            | Error::HopLimitExceeded(m)
            | Error::UnknownChannel(m)
            | Error::InvalidState(m)
            | Error::LedgerRejected(m)
            | Error::Persist(m)
            | Error::Internal(m) => m,
        }
    }

    /// Whether a peer's failure to settle should make a cooperative close
    /// fall back to broadcasting the local commitment.
    ///
    /// Besides transport and protocol failures this covers a peer that no
    /// longer considers the channel open, since it will never countersign.
    pub fn is_close_fallback(&self) -> bool {
        matches!(
            self,
            Error::NetworkFailure(_)
                | Error::ProtocolTimeout(_)
                | Error::ProtocolViolation(_)
                | Error::SignatureMismatch(_)
                | Error::InvalidState(_)
                | Error::UnknownChannel(_)
        )
    }
}

impl From<persist::Error> for Error {
    fn from(e: persist::Error) -> Self {
        Error::Persist(format!("{:?}", e))
    }
}

/// Construct a [`Error::ProtocolViolation`], logging it at creation.
pub(crate) fn protocol_violation(msg: impl Into<String>) -> Error {
    let s = msg.into();
    error!("PROTOCOL VIOLATION: {}", s);
    Error::ProtocolViolation(s)
}

/// Construct a [`Error::SignatureMismatch`], logging it at creation.
pub(crate) fn signature_mismatch(msg: impl Into<String>) -> Error {
    let s = msg.into();
    error!("SIGNATURE MISMATCH: {}", s);
    Error::SignatureMismatch(s)
}

/// Construct an [`Error::Internal`], logging it at creation.
pub(crate) fn internal_error(msg: impl Into<String>) -> Error {
    let s = msg.into();
    error!("INTERNAL ERROR: {}", s);
    Error::Internal(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn code_roundtrip_preserves_kind_test() {
        let errors = vec![
            Error::NegotiationRejected("a".into()),
            Error::SignatureMismatch("b".into()),
            Error::BalanceExceeded("c".into()),
            Error::InvalidSplit("d".into()),
            Error::UnknownRoute("e".into()),
            Error::InsufficientBalance("f".into()),
            Error::NetworkFailure("g".into()),
            Error::ProtocolTimeout("h".into()),
            Error::ProtocolViolation("i".into()),
            Error::HopLimitExceeded("j".into()),
            Error::UnknownChannel("k".into()),
            Error::InvalidState("l".into()),
            Error::LedgerRejected("m".into()),
            Error::Persist("n".into()),
            Error::Internal("o".into()),
        ];
        for e in errors {
            assert_eq!(Error::from_code(e.code(), e.message()), e);
        }
    }

    #[test]
    fn unknown_code_is_internal_test() {
        let e = Error::from_code(-1, "boom");
        assert_eq!(e, Error::Internal("code -1: boom".into()));
        assert_eq!(e.to_string(), "internal error: code -1: boom");
    }

    #[test]
    fn close_fallback_kinds_test() {
        assert!(Error::ProtocolTimeout(String::new()).is_close_fallback());
        assert!(Error::NetworkFailure(String::new()).is_close_fallback());
        assert!(Error::InvalidState(String::new()).is_close_fallback());
        assert!(Error::UnknownChannel(String::new()).is_close_fallback());
        assert!(!Error::Persist(String::new()).is_close_fallback());
        assert!(!Error::LedgerRejected(String::new()).is_close_fallback());
    }
}
