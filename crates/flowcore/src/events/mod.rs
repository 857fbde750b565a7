mod base;

pub use base::{CancelReason, EventBus, EventEmitter, ExecutionEvent, NodeEvent};
