//! Named publish/subscribe topics
//!
//! Publishing never blocks: slow subscribers lag and lose the oldest items instead of
//! stalling the publisher. Pull-style access to the current value of an item is left to
//! the owner of the topic.
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::pubsub::{self, PubSubChannel, Subscriber};

use crate::trace;

/// Topic errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TopicError {
    /// All subscriber slots are in use
    TooManySubscribers,
}

/// Subscription handle
pub type Subscription<'a, M, T, const CAP: usize, const SUBS: usize> = Subscriber<'a, M, T, CAP, SUBS, 1>;

/// A named topic
pub struct Topic<M: RawMutex, T: Clone, const CAP: usize, const SUBS: usize> {
    name: &'static str,
    channel: PubSubChannel<M, T, CAP, SUBS, 1>,
}

impl<M: RawMutex, T: Clone, const CAP: usize, const SUBS: usize> Topic<M, T, CAP, SUBS> {
    /// Create a new topic
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            channel: PubSubChannel::new(),
        }
    }

    /// Topic name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Notify all subscribers of a change
    pub fn publish(&self, item: T) {
        trace!("{}: publish", self.name);
        self.channel.immediate_publisher().publish_immediate(item);
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> Result<Subscription<'_, M, T, CAP, SUBS>, TopicError> {
        self.channel.subscriber().map_err(|e| match e {
            pubsub::Error::MaximumSubscribersReached | pubsub::Error::MaximumPublishersReached => {
                TopicError::TooManySubscribers
            }
        })
    }
}
