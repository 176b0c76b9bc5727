pub mod control;
pub mod event;
pub mod plan;
pub mod types;

pub use control::{
    ConditionalBranch, ConditionalConfig, ConditionalKind, ControlFlow, ForEachConfig,
    SubflowConfig,
};
pub use event::{Event, EventInput, EventType};
pub use plan::{EdgeSpec, NodeSpec, Plan};
pub use types::*;
