pub mod accumulator;
pub mod decoder;
pub mod event;

pub use accumulator::{OutputAccumulator, Outcome, Step};
pub use decoder::LineDecoder;
pub use event::{ContentBlock, UserTurn, WorkerEvent, DEFAULT_SESSION_ID};
