//! Pre-dispatch event hooks.
//!
//! Subscribers see traffic before the proxy acts on it: raw UDP data on
//! the way in and out, and individual Bedrock packets on the way through
//! a batch. A subscriber can rewrite an event's payload in place or
//! cancel it, which short-circuits the remaining subscribers and drops
//! the event for all downstream stages.

use crate::{origin::Origin, session::State};
use async_trait::async_trait;
use std::{net::SocketAddr, ops::ControlFlow};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A UDP payload arrived from `origin`.
    DataIn { origin: Origin, data: Vec<u8> },
    /// A UDP payload is about to be sent to the endpoint on side
    /// `toward`, at address `to`.
    DataOut {
        toward: Origin,
        data: Vec<u8>,
        to: Option<SocketAddr>,
    },
    /// A Bedrock packet was unwrapped from a batch sent by `origin`.
    BedrockIn { origin: Origin, data: Vec<u8> },
    /// A Bedrock packet is about to be re-packed toward the opposite
    /// side of `origin`.
    BedrockOut { origin: Origin, data: Vec<u8> },
    /// The session advanced to a new state.
    State { state: State },
}

/// A hook invoked for every event before the proxy dispatches it.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Inspect and optionally mutate `event`. `Break` cancels it.
    async fn handle(&self, event: &mut Event) -> ControlFlow<()>;
}

/// Registry of [`Subscriber`]s, awaited in registration order.
#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<Box<dyn Subscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, subscriber: Box<dyn Subscriber>) {
        self.subscribers.push(subscriber);
    }

    /// Emits an event. The first cancellation wins; later subscribers
    /// are not consulted.
    pub async fn emit(&self, event: &mut Event) -> ControlFlow<()> {
        for subscriber in &self.subscribers {
            subscriber.handle(event).await?;
        }
        ControlFlow::Continue(())
    }
}
