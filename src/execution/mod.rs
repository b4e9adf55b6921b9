pub mod builtin;
pub mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod interaction;
pub mod predicate;
pub mod registry;
pub mod service;
pub mod session;
pub mod step;
pub mod store;
pub mod template;

pub use context::{ContextSnapshot, ExecutionContext, ExecutionMetrics, RemoteConnection, VarScope};
pub use engine::{EngineSettings, ExecutionEngine, SessionRun};
pub use error::ExecutionError;
pub use events::{
    ChannelPublisher, EventKind, FanoutPublisher, JsonlPublisher, ProgressEvent, ProgressPublisher,
    SessionEvents,
};
pub use interaction::{Interaction, InteractionGateway, InteractionRequest, InteractionStatus};
pub use predicate::{Condition, StepPredicateEvaluator, VarLookup};
pub use registry::{SessionHandle, SessionRegistry};
pub use service::{ExecutionService, StartOptions};
pub use session::{ExecutionSession, SessionStatus};
pub use step::{
    compile_steps, plan_digest, InteractionKind, SessionPlan, StepKind, StepResult, StepSpec,
};
pub use store::{FileSessionStore, SessionStore, SqliteSessionStore};
