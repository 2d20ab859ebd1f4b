//! Subscription pipeline (spec §4.3, §4.4): outbound publishing
//! ([`emitter`]) and inbound callback processing ([`callback_processor`]).

pub mod callback_processor;
pub mod emitter;

pub use callback_processor::{CallbackProcessor, ProcessResult};
pub use emitter::SubscriptionEmitter;
