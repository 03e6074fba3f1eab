//! Event envelope and handler replies.
//!
//! Handlers never mutate an [`Event`]. They return a [`Reply`]; the
//! dispatcher folds replies into a [`Response`] where the last
//! acknowledgment wins and `acknowledged` never goes back to false.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use super::channel::{channel_name, ChannelId};
use crate::context::Context;
use crate::types::BoxError;

/// Shared, type-erased event payload.
#[derive(Clone)]
pub struct Payload {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl Payload {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Wrap an already shared value without another allocation.
    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Self {
            value,
            type_name: std::any::type_name::<T>(),
        }
    }

    /// The unit payload.
    pub fn empty() -> Self {
        Self::new(())
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    pub fn downcast_arc<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.value.clone().downcast::<T>().ok()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload<{}>", self.type_name)
    }
}

/// What a handler did with an event.
#[derive(Debug, Clone, Default)]
pub enum Reply {
    /// Not handled; dispatch moves on.
    #[default]
    Pass,
    /// Handled, optionally with a value for the sender.
    Ack(Option<Payload>),
}

impl Reply {
    /// Acknowledge without a value.
    pub fn ack() -> Self {
        Reply::Ack(None)
    }

    /// Acknowledge with a value.
    pub fn with<T: Any + Send + Sync>(value: T) -> Self {
        Reply::Ack(Some(Payload::new(value)))
    }

    pub fn is_ack(&self) -> bool {
        matches!(self, Reply::Ack(_))
    }
}

/// Result of a handler invocation.
pub type HandlerResult = std::result::Result<Reply, BoxError>;

/// Accumulated acknowledgment state of one dispatch.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub acknowledged: bool,
    pub value: Option<Payload>,
}

impl Response {
    /// Fold a reply in. Returns true when it was an acknowledgment.
    pub fn record(&mut self, reply: Reply) -> bool {
        match reply {
            Reply::Pass => false,
            Reply::Ack(value) => {
                self.acknowledged = true;
                self.value = value;
                true
            }
        }
    }

    pub fn value_as<T: Any>(&self) -> Option<&T> {
        self.value.as_ref().and_then(|p| p.downcast_ref::<T>())
    }
}

/// Callback fired at each acknowledgment of an asynchronous send.
pub type ResponseCallback = Arc<dyn Fn(&Response) + Send + Sync>;

/// One dispatch of a payload on a channel.
#[derive(Clone)]
pub struct Event {
    channel: ChannelId,
    context: Context,
    payload: Payload,
    broadcast: bool,
}

impl Event {
    pub fn new(channel: ChannelId, context: Context, payload: Payload, broadcast: bool) -> Self {
        Self {
            channel,
            context,
            payload,
            broadcast,
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Registered channel name.
    pub fn name(&self) -> Arc<str> {
        channel_name(self.channel)
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn payload_as<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    pub fn is_broadcast(&self) -> bool {
        self.broadcast
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("channel", &self.name())
            .field("payload", &self.payload)
            .field("broadcast", &self.broadcast)
            .field("trace_id", &self.context.trace_id())
            .finish()
    }
}
