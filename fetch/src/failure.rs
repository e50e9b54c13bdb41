//! Classification of low-level fetch failures.

use std::{borrow::Cow, error::Error as StdError};
use thiserror::Error;

/// Reason a low-level lookup did not return a block.
///
/// Codes are stable and carried verbatim to the request group once a request
/// gives up. The taxonomy carries no retry policy of its own: whether a failure
/// is retried is decided by the [crate::request::Request] that observed it.
#[derive(Error, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Failure {
    /// Decode of the data failed (probably bogus at the source).
    #[error("Decode of data failed, probably was bogus at source")]
    DecodeFailed,
    /// Data was not in the local store and the request was local-only.
    #[error("Data was not in store and request was local-only")]
    NotFoundLocally,
    /// An internal error occurred.
    #[error("Internal error - probably a bug")]
    InternalError,
    /// The request visited many nodes without finding the data.
    #[error("Could not find the data")]
    NotFoundInNetwork,
    /// Not enough nodes could be found to be confident the data does not exist.
    #[error("Could not find enough nodes to be sure that the data is not out there somewhere")]
    NoRouteFound,
    /// A downstream node timed out or was overloaded and rejected the request.
    #[error("A node downstream either timed out or was overloaded (retry)")]
    OverloadRejected,
    /// Transfer of data started, then failed.
    #[error("Started to transfer data, then failed (should be rare)")]
    TransferFailed,
    /// Data was transferred but did not verify against its key.
    #[error("Node sent us invalid data")]
    VerifyFailed,
    /// The request was cancelled locally.
    #[error("Request cancelled")]
    Cancelled,
}

impl Failure {
    /// Every failure, in code order.
    pub const ALL: [Failure; 9] = [
        Failure::DecodeFailed,
        Failure::NotFoundLocally,
        Failure::InternalError,
        Failure::NotFoundInNetwork,
        Failure::NoRouteFound,
        Failure::OverloadRejected,
        Failure::TransferFailed,
        Failure::VerifyFailed,
        Failure::Cancelled,
    ];

    /// Returns the numeric code of the failure.
    pub fn code(&self) -> u8 {
        match self {
            Failure::DecodeFailed => 1,
            Failure::NotFoundLocally => 2,
            Failure::InternalError => 3,
            Failure::NotFoundInNetwork => 4,
            Failure::NoRouteFound => 5,
            Failure::OverloadRejected => 6,
            Failure::TransferFailed => 7,
            Failure::VerifyFailed => 8,
            Failure::Cancelled => 9,
        }
    }

    /// Returns the failure with the given numeric code, if any.
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|failure| failure.code() == code)
    }
}

/// Returns the human-readable description of a failure code.
///
/// Codes outside of the taxonomy are reported as unknown rather than rejected,
/// so that codes relayed from elsewhere can always be displayed.
pub fn describe(code: i64) -> Cow<'static, str> {
    let known = u8::try_from(code).ok().and_then(Failure::from_code);
    match known {
        Some(failure) => Cow::Owned(failure.to_string()),
        None => Cow::Owned(format!("Unknown error code: {code}")),
    }
}

/// Error returned by a [crate::Lookup].
#[derive(Error, Debug)]
pub enum Fault {
    /// The lookup failed for a known reason.
    #[error("lookup failed: {0}")]
    Classified(Failure),
    /// The lookup failed for a reason outside of the taxonomy.
    #[error("unexpected lookup error: {0}")]
    Unexpected(Box<dyn StdError + Send + Sync>),
}

impl Fault {
    /// Create an unexpected fault from any error.
    pub fn unexpected(err: impl StdError + Send + Sync + 'static) -> Self {
        Self::Unexpected(Box::new(err))
    }

    /// Returns the classified failure, treating anything unexpected as an internal error.
    pub fn failure(&self) -> Failure {
        match self {
            Fault::Classified(failure) => *failure,
            Fault::Unexpected(_) => Failure::InternalError,
        }
    }
}

impl From<Failure> for Fault {
    fn from(failure: Failure) -> Self {
        Self::Classified(failure)
    }
}
