//! Update dispatch: middleware pipeline whose terminal step is the priority router.

mod canned;
mod pipeline;
mod router;
mod state;

pub use canned::CannedReplies;
pub use pipeline::{
    Dispatch, ErrorBoundary, LoggingMiddleware, Middleware, Next, Pipeline, PipelineBuilder,
    DEFAULT_ERROR_NOTICE,
};
pub use router::{
    CallbackHandler, CommandHandler, FallbackNotifier, HandlerTable, HandlerTableBuilder,
    PriorityRouter, RouteOutcome,
};
pub use state::{ConversationState, StateMachine, Stateless};
