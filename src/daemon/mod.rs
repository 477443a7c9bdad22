mod context;
mod machine;
mod states;

pub use context::{Context, DeploymentData};
pub use machine::{ExternalEvent, StartMode, StateMachine};
pub use states::{resume_state, transition, State, StateEvent};
