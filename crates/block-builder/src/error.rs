use std::time::Duration;

use alloy_primitives::B256;
use tandem_engine::EngineError;
use tandem_primitives::CodecError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Nothing to include and the empty-block delay has not passed yet.
    /// Not a failure: the cycle should be skipped.
    #[error("no transactions to include; next empty block allowed in {retry_after:?}")]
    EmptyBlock { retry_after: Duration },

    #[error("`{operation}` failed after {attempts} attempts")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        last: Box<Error>,
    },

    #[error("invalid block height: got {got}, expected {expected}")]
    InvalidHeight { got: u64, expected: u64 },

    #[error("invalid parent hash: got {got}, expected {expected}")]
    InvalidParentHash { got: B256, expected: B256 },

    #[error("invalid timestamp: got {got}, must be after {parent}")]
    InvalidTimestamp { got: u64, parent: u64 },

    #[error("invalid random value: got {got}, expected {expected}")]
    InvalidRandom { got: B256, expected: B256 },

    #[error("execution engine rejected the payload: {validation_error}")]
    PayloadInvalid {
        validation_error: String,
        latest_valid_hash: Option<B256>,
    },

    #[error("execution engine answered the build request with status `{status}`")]
    UnexpectedBuildStatus { status: String },

    #[error("execution engine accepted the build request without returning a payload id")]
    MissingPayloadId,

    #[error("execution engine no longer knows the payload")]
    UnknownPayload,

    #[error("payload id or payload is empty")]
    EmptyPayload,

    #[error("failed decoding payload")]
    Decode(#[from] CodecError),

    #[error("failed encoding payload")]
    Encode(#[source] CodecError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("replicated state rejected the operation: {0:#}")]
    State(eyre::Report),

    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// The payload is the block directly below the one expected next, which
    /// is what re-applying the current head looks like.
    pub fn is_already_applied(&self) -> bool {
        matches!(self, Self::InvalidHeight { got, expected } if got.checked_add(1) == Some(*expected))
    }

    /// Retrying the same payload or build request cannot succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::InvalidHeight { .. }
                | Self::InvalidParentHash { .. }
                | Self::InvalidTimestamp { .. }
                | Self::InvalidRandom { .. }
                | Self::PayloadInvalid { .. }
                | Self::UnexpectedBuildStatus { .. }
                | Self::MissingPayloadId
                | Self::UnknownPayload
                | Self::EmptyPayload
                | Self::Decode(_)
                | Self::Encode(_)
        )
    }

    pub fn is_retries_exhausted(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::Error;

    #[test]
    fn only_the_block_below_the_expected_one_counts_as_applied() {
        assert!(Error::InvalidHeight { got: 100, expected: 101 }.is_already_applied());
        assert!(!Error::InvalidHeight { got: 99, expected: 101 }.is_already_applied());
        assert!(!Error::InvalidHeight { got: 102, expected: 101 }.is_already_applied());
        assert!(!Error::EmptyBlock { retry_after: Duration::ZERO }.is_already_applied());
    }

    #[test]
    fn height_mismatch_keeps_its_message() {
        assert_eq!(
            Error::InvalidHeight { got: 100, expected: 101 }.to_string(),
            "invalid block height: got 100, expected 101",
        );
    }

    #[test]
    fn exhaustion_and_skips_are_not_permanent() {
        let exhausted = Error::RetriesExhausted {
            operation: "get_payload",
            attempts: 10,
            last: Box::new(Error::Cancelled),
        };
        assert!(exhausted.is_retries_exhausted());
        assert!(!exhausted.is_permanent());
        assert!(!Error::EmptyBlock { retry_after: Duration::ZERO }.is_permanent());
        assert!(Error::UnknownPayload.is_permanent());
    }
}
