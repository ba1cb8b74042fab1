use serde::{Deserialize, Serialize};

/// Where the leader is in producing the current block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum BuildStep {
    #[default]
    BuildBlock,
    FinalizeBlock,
    /// A step value written by something other than this node.
    Unrecognized(u8),
}

impl From<u8> for BuildStep {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::BuildBlock,
            1 => Self::FinalizeBlock,
            other => Self::Unrecognized(other),
        }
    }
}

impl From<BuildStep> for u8 {
    fn from(step: BuildStep) -> Self {
        match step {
            BuildStep::BuildBlock => 0,
            BuildStep::FinalizeBlock => 1,
            BuildStep::Unrecognized(other) => other,
        }
    }
}

impl std::fmt::Display for BuildStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BuildBlock => f.write_str("build_block"),
            Self::FinalizeBlock => f.write_str("finalize_block"),
            Self::Unrecognized(other) => write!(f, "unrecognized({other})"),
        }
    }
}

/// The leader's durable progress record.
///
/// `payload_id` and `encoded_payload` are only populated while `step` is
/// [`BuildStep::FinalizeBlock`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildState {
    #[serde(rename = "current_step")]
    pub step: BuildStep,
    pub payload_id: String,
    #[serde(rename = "execution_payload")]
    pub encoded_payload: String,
}

impl BuildState {
    /// The initial state, also what a reset goes back to.
    pub fn build_block() -> Self {
        Self::default()
    }

    pub fn finalize_block(payload_id: impl Into<String>, encoded_payload: impl Into<String>) -> Self {
        Self {
            step: BuildStep::FinalizeBlock,
            payload_id: payload_id.into(),
            encoded_payload: encoded_payload.into(),
        }
    }

    /// True if a built block was handed off but not yet confirmed as applied.
    pub fn has_pending_payload(&self) -> bool {
        self.step == BuildStep::FinalizeBlock && !self.encoded_payload.is_empty()
    }

    pub fn to_record(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }

    pub fn from_record(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::{BuildState, BuildStep};

    #[test]
    fn record_keeps_step_and_payload() {
        let state = BuildState::finalize_block("0x0000000000000001", "AAEC");
        let decoded = BuildState::from_record(&state.to_record().unwrap()).unwrap();
        assert_eq!(decoded, state);
        assert!(decoded.has_pending_payload());
    }

    #[test]
    fn unknown_step_values_survive_decoding() {
        #[derive(serde::Serialize)]
        struct Foreign<'a> {
            current_step: u8,
            payload_id: &'a str,
            execution_payload: &'a str,
        }
        let bytes = rmp_serde::to_vec_named(&Foreign {
            current_step: 7,
            payload_id: "",
            execution_payload: "",
        })
        .unwrap();

        let state = BuildState::from_record(&bytes).unwrap();
        assert_eq!(state.step, BuildStep::Unrecognized(7));
        assert!(!state.has_pending_payload());
    }

    #[test]
    fn fresh_state_builds() {
        let state = BuildState::build_block();
        assert_eq!(state.step, BuildStep::BuildBlock);
        assert!(state.payload_id.is_empty());
        assert!(state.encoded_payload.is_empty());
    }
}
