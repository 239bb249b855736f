pub mod cancel;
pub mod engine;
pub mod orchestrator;

pub use cancel::{CancelMap, CancelToken};
pub use engine::{ToolDispatcher, TurnContext, TurnEvent};
