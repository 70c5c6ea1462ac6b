//! Event model for the matching engine.
//!
//! Patterns and events share one capability, [`EventPattern`]: a stable,
//! ordered enumeration of set attributes. The index never looks at concrete
//! types, so typed specs and decoded JSON events can be matched against each
//! other.

mod event;
mod pattern;

pub use event::{Event, EventError};
pub use pattern::{AttrValue, ChainStep, EventPattern, PatternKey, Scalar};
