use thiserror::Error;

/// Errors that signal a violation of the cell or pool usage contract.
///
/// None of these are transient. They indicate a programming error in the caller, such as
/// releasing a handle twice or reading through a handle that has already been released,
/// and are never retried or swallowed by the pool.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The handle was already released, or the cell it points to has no references left.
    #[error("attempted to access a cell with zero references")]
    ZeroReference,

    /// A release was attempted without a matching acquire or copy.
    #[error("cell reference count underflow: release without a matching acquire or copy")]
    Underflow,

    /// The reference count of the cell cannot be increased any further.
    #[error("cell reference count overflow: {count} references are already held")]
    Overflow {
        /// The reference count observed when the copy was rejected.
        count: i32,
    },

    /// The consumer token does not grant access to the cell.
    #[error("consumer {consumer_bit:#x} does not have access to this cell")]
    AccessDenied {
        /// The consumer bit carried by the rejected token.
        consumer_bit: u64,
    },

    /// Every consumer bit of the pool has already been handed out.
    #[error("all 64 consumers of the pool are already registered")]
    ConsumerCapacityExceeded,

    /// A named pool already exists but stores a different payload type.
    #[error("named pool '{name}' already exists with payload type {existing_type}")]
    PoolTypeMismatch {
        /// The name that was requested.
        name: String,

        /// Type name of the payload stored by the existing pool.
        existing_type: &'static str,
    },
}

/// A specialized `Result` type for pool and cell operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug);

    #[test]
    fn messages_name_the_violation() {
        assert_eq!(
            Error::ZeroReference.to_string(),
            "attempted to access a cell with zero references"
        );
        assert!(Error::Underflow.to_string().contains("underflow"));
        assert!(
            Error::Overflow { count: 7 }
                .to_string()
                .contains("7 references")
        );
    }

    #[test]
    fn access_denied_shows_bit_in_hex() {
        let error = Error::AccessDenied { consumer_bit: 16 };

        assert_eq!(
            error.to_string(),
            "consumer 0x10 does not have access to this cell"
        );
    }

    #[test]
    fn capacity_error_mentions_limit() {
        assert!(
            Error::ConsumerCapacityExceeded
                .to_string()
                .contains("all 64 consumers")
        );
    }

    #[test]
    fn type_mismatch_names_pool_and_type() {
        let error = Error::PoolTypeMismatch {
            name: "quotes".to_string(),
            existing_type: "u64",
        };

        let message = error.to_string();
        assert!(message.contains("'quotes'"));
        assert!(message.contains("u64"));
    }
}
