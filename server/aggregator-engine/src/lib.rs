//! Message correlation and aggregation engine.
//!
//! Groups independently-arriving messages under a correlation key, evaluates
//! a pluggable release policy after every admit, and reduces each complete
//! group into exactly one output message. A background reaper expires groups
//! that never complete and hands them to a discard sink.
//!
//! Transports and persistence are collaborators: messages come in through
//! [`CorrelatingEngine::submit`] and leave through a [`MessageSink`].

pub mod condition;
pub mod config;
pub mod correlation;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod normalize;
pub mod processor;
pub mod reaper;
pub mod release;
pub mod sink;
pub mod stats;
pub mod store;
pub mod types;

pub use config::Config;
pub use engine::{Admission, CorrelatingEngine, ReapReport, Strategies};
pub use error::{EngineError, ProcessorError};
pub use reaper::ReaperHandle;
pub use sink::{CollectingSink, MessageSink};
pub use store::{Drained, GroupLock, InMemoryGroupStore, LockedGroup, MessageGroupStore};
pub use types::{CorrelationKey, GroupState, InboundMessage, Message, MessageGroup};
