// SPDX-License-Identifier: MIT
//
// An in-process publish/subscribe message bus: pooled, reference-counted
// messages delivered to Callback, Mailbox or WorkQueue subscribers
// through a central broker, plus an optional hierarchical state machine
// engine built on top of the same message plumbing.

pub mod header;
pub mod pool;
pub mod registry;
pub mod message;

mod queue;

pub mod callback_msg;
pub mod subscriber;
pub mod broker;
pub mod delayed;
pub mod hsm;

#[cfg(feature = "default-broker")]
pub mod default_broker;

pub use broker::Broker;
pub use callback_msg::{CallbackFn, CallbackMsg};
pub use delayed::{DelayedError, DelayedMsg};
pub use header::{MsgHeader, ALLOC_ID_CALLBACK, ALLOC_ID_INVALID, ALLOC_ID_STATIC};
pub use hsm::{Hsm, StateFn, StateReturn};
pub use message::{Envelope, MsgHandle, RawMsg, ReleaseRoute, StaticMsg};
pub use pool::{Block, Deadline, FixedPool, Pool};
pub use registry::{AllocatorRegistry, RegistryError};
pub use subscriber::{Discipline, HandleOutcome, Subscriber, SubscriberError};

#[cfg(feature = "default-broker")]
pub use default_broker::{add_allocator, add_subscriber, default_broker, new_msg, publish, remove_subscriber};
