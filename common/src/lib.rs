pub mod actuator;
pub mod config;
pub mod heater;
pub mod sensor;
pub mod store;
pub mod timer;
pub mod topics;
pub mod types;

pub use actuator::{ActionSink, ActuatorGateway, Dispatch, DispatchError};
pub use config::{EntityConfig, HeaterConfig, NetworkConfig, RuntimeConfig, POWER_ON_THRESHOLD};
pub use heater::{ClimateState, HeaterEngine, HeaterEvent};
pub use sensor::{SensorCache, SensorReading};
pub use store::{MemoryStore, PersistedState, StateStore, StoreError};
pub use timer::{TimerFired, TimerKind, Timers};
pub use topics::*;
pub use types::{HeaterAction, HeaterMode, HeaterStatus, SensorKind};
