use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::HeaterMode;

pub const STATE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("persisted state is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported persisted state version {0}")]
    UnsupportedVersion(u32),
    #[error("persisted target temperature is not a number")]
    InvalidTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub mode: HeaterMode,
    #[serde(rename = "targetTemperature")]
    pub target_temperature: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateDocument {
    version: u32,
    #[serde(flatten)]
    state: PersistedState,
}

impl PersistedState {
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let document = StateDocument {
            version: STATE_SCHEMA_VERSION,
            state: *self,
        };
        Ok(serde_json::to_vec_pretty(&document)?)
    }

    pub fn decode(raw: &[u8]) -> Result<Self, StoreError> {
        let document: StateDocument = serde_json::from_slice(raw)?;
        if document.version != STATE_SCHEMA_VERSION {
            return Err(StoreError::UnsupportedVersion(document.version));
        }
        if !document.state.target_temperature.is_finite() {
            return Err(StoreError::InvalidTarget);
        }
        Ok(document.state)
    }
}

/// Durable holder of the `(mode, target)` pair. `load` yields `Ok(None)` on a
/// cold start; a save must never be observable half-written.
pub trait StateStore {
    fn load(&self) -> Result<Option<PersistedState>, StoreError>;
    fn save(&mut self, state: &PersistedState) -> Result<(), StoreError>;
}

/// Keeps the encoded document in memory, sharing the file format's codec.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    raw: Option<Vec<u8>>,
    saves: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_raw(raw: impl Into<Vec<u8>>) -> Self {
        Self {
            raw: Some(raw.into()),
            saves: 0,
        }
    }

    pub fn with_state(state: PersistedState) -> Result<Self, StoreError> {
        Ok(Self::with_raw(state.encode()?))
    }

    pub fn saves(&self) -> usize {
        self.saves
    }
}

impl StateStore for MemoryStore {
    fn load(&self) -> Result<Option<PersistedState>, StoreError> {
        self.raw.as_deref().map(PersistedState::decode).transpose()
    }

    fn save(&mut self, state: &PersistedState) -> Result<(), StoreError> {
        self.raw = Some(state.encode()?);
        self.saves += 1;
        Ok(())
    }
}
