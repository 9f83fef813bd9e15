//! Semantic failure kinds for arena operations.  These are policy
//! outcomes, not OS error codes: a `CommitLimit` is a configured
//! ceiling, a `Resource` is exhaustion after every placement plan has
//! been tried.
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum Error {
    /// The configuration is inconsistent with itself or the platform,
    /// e.g. a zone stripe smaller than the page size.
    #[error("configuration inconsistent with platform constraints")]
    Memory,

    /// Address space is exhausted: every placement plan, including the
    /// last-resort search over all zones, came up empty.
    #[error("address space exhausted")]
    Resource,

    /// Allocating would exceed the configured commit ceiling.  Raised
    /// before any index is disturbed.
    #[error("commit limit would be exceeded")]
    CommitLimit,

    /// The block pool backing the range indices is out of nodes.
    /// Internal: always resolved by the bootstrap page allocator or by
    /// the self-healing free path, never surfaced to callers.
    #[error("range-set block pool exhausted")]
    Limit,

    /// The request violates an arena invariant, e.g. shrinking the
    /// commit limit below live commitment.
    #[error("request violates an arena invariant")]
    Fail,

    /// The chosen arena class does not support this operation.
    #[error("not supported by this arena class")]
    Unimpl,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for the failures that mean "the allocation itself could
    /// not be satisfied", as opposed to configuration or protocol
    /// errors.
    pub fn is_alloc_failure(self) -> bool {
        matches!(self, Error::Resource | Error::CommitLimit)
    }
}
