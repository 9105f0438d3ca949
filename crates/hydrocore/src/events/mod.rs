mod base;
mod progress;

pub use base::{EventBus, EventSink, ExecutionEvent, LogLevel, NullEvents, RunId};
pub use progress::{BlockEvent, BlockStatus, BlockTiming, RunIdentifiers};
