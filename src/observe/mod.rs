//! Pattern-based subscription and dispatch.

pub mod attribute_index;
pub mod dispatch;
pub mod listener;
pub mod registry;

pub use attribute_index::{AttributeIndex, PatternMatch};
pub use dispatch::{DispatchEngine, DispatchError, Publisher};
pub use listener::{ChannelGroups, Listener, ListenerContext, ListenerFn, Service, ServiceLocator};
pub use registry::{RegistryError, SubscriptionRegistry};
