use thiserror::Error;
use tracing::{info, warn};

use crate::{config::EntityConfig, types::HeaterAction};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("action sink unavailable: {0}")]
    Unavailable(String),
    #[error("action {action_id} rejected: {reason}")]
    Rejected { action_id: String, reason: String },
}

/// Outbound boundary that fires a named external action. Success only means
/// the action was handed off; the heater never acknowledges it.
pub trait ActionSink {
    fn dispatch(&mut self, action: HeaterAction, action_id: &str) -> Result<(), DispatchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Sent,
    Throttled,
    Failed,
}

/// Rate-limited front of the action sink. Calls inside the spacing window
/// are dropped, not queued, and failures are never retried here.
pub struct ActuatorGateway<A> {
    sink: A,
    toggle_id: String,
    step_up_id: String,
    step_down_id: String,
    min_spacing_ms: u64,
    last_call_ms: Option<u64>,
}

impl<A: ActionSink> ActuatorGateway<A> {
    pub fn new(sink: A, entity: &EntityConfig, min_spacing_ms: u64) -> Self {
        Self {
            sink,
            toggle_id: entity.toggle_action.clone(),
            step_up_id: entity.step_up_action.clone(),
            step_down_id: entity.step_down_action.clone(),
            min_spacing_ms,
            last_call_ms: None,
        }
    }

    pub fn toggle_power(&mut self, now_ms: u64) -> Dispatch {
        self.trigger(HeaterAction::Toggle, now_ms)
    }

    pub fn step_up(&mut self, now_ms: u64) -> Dispatch {
        self.trigger(HeaterAction::StepUp, now_ms)
    }

    pub fn step_down(&mut self, now_ms: u64) -> Dispatch {
        self.trigger(HeaterAction::StepDown, now_ms)
    }

    pub fn trigger(&mut self, action: HeaterAction, now_ms: u64) -> Dispatch {
        if let Some(last) = self.last_call_ms {
            let elapsed = now_ms.saturating_sub(last);
            if elapsed < self.min_spacing_ms {
                warn!(
                    "dropping {} ({}ms since last action, spacing {}ms)",
                    action.as_str(),
                    elapsed,
                    self.min_spacing_ms
                );
                return Dispatch::Throttled;
            }
        }
        self.last_call_ms = Some(now_ms);

        let action_id = match action {
            HeaterAction::Toggle => &self.toggle_id,
            HeaterAction::StepUp => &self.step_up_id,
            HeaterAction::StepDown => &self.step_down_id,
        };

        match self.sink.dispatch(action, action_id) {
            Ok(()) => {
                info!("dispatched {} via {action_id}", action.as_str());
                Dispatch::Sent
            }
            Err(err) => {
                warn!("dispatch of {} failed: {err}", action.as_str());
                Dispatch::Failed
            }
        }
    }

    pub fn last_call_ms(&self) -> Option<u64> {
        self.last_call_ms
    }

    pub fn sink(&self) -> &A {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut A {
        &mut self.sink
    }
}

/// Sink double that records every dispatch and can be told to fail.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    pub calls: Vec<HeaterAction>,
    pub fail: bool,
}

#[cfg(test)]
impl RecordingSink {
    pub fn count(&self, action: HeaterAction) -> usize {
        self.calls.iter().filter(|call| **call == action).count()
    }
}

#[cfg(test)]
impl ActionSink for RecordingSink {
    fn dispatch(&mut self, action: HeaterAction, action_id: &str) -> Result<(), DispatchError> {
        self.calls.push(action);
        if self.fail {
            return Err(DispatchError::Rejected {
                action_id: action_id.to_string(),
                reason: "test failure".to_string(),
            });
        }
        Ok(())
    }
}
