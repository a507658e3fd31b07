//! In-process realtime bus: publish-on-write, subscribe per user.
//!
//! Each user has their own bounded channel, so a burst for one user can only make that
//! user's feeds fall behind.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use shared::{domain::UserId, protocol::ServerEvent};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

#[derive(Clone)]
pub struct EventBus {
    capacity: usize,
    channels: Arc<Mutex<HashMap<UserId, broadcast::Sender<ServerEvent>>>>,
}

impl EventBus {
    /// `capacity` bounds how far each user's feeds may fall behind before resyncing.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Arc::default(),
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<UserId, broadcast::Sender<ServerEvent>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns how many live feeds saw the event. Publishing with nobody listening is
    /// not an error.
    pub fn publish(&self, audience: Vec<UserId>, event: ServerEvent) -> usize {
        if audience.is_empty() {
            return 0;
        }
        debug!(
            audience = audience.len(),
            conversation_id = ?event.conversation_id(),
            "publishing event"
        );

        let mut channels = self.channels();
        let mut delivered = 0;
        for user_id in audience {
            let Some(sender) = channels.get(&user_id) else {
                continue;
            };
            match sender.send(event.clone()) {
                Ok(receivers) => delivered += receivers,
                Err(_) => {
                    channels.remove(&user_id);
                    debug!(%user_id, "dropped channel with no feeds");
                }
            }
        }
        delivered
    }

    pub fn subscribe(&self, user_id: UserId) -> UserFeed {
        let receiver = self
            .channels()
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        UserFeed { user_id, receiver }
    }

    pub fn subscriber_count(&self) -> usize {
        self.channels()
            .values()
            .map(broadcast::Sender::receiver_count)
            .sum()
    }
}

/// Events addressed to one user, in publish order.
pub struct UserFeed {
    user_id: UserId,
    receiver: broadcast::Receiver<ServerEvent>,
}

impl UserFeed {
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Waits for the next event for this user. A feed that fell behind yields
    /// [`ServerEvent::ResyncRequired`] once and continues from the oldest retained event.
    /// Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        match self.receiver.recv().await {
            Ok(event) => Some(event),
            Err(RecvError::Lagged(skipped)) => {
                warn!(user_id = %self.user_id, skipped, "event feed lagged");
                Some(ServerEvent::ResyncRequired)
            }
            Err(RecvError::Closed) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{domain::ConversationId, protocol::ConversationChange};

    fn pinned(id: i64) -> ServerEvent {
        ServerEvent::ConversationUpdated {
            conversation_id: ConversationId(id),
            change: ConversationChange::Pinned,
        }
    }

    #[tokio::test]
    async fn feeds_only_see_their_own_events() {
        let bus = EventBus::new(16);
        let mut alice = bus.subscribe(UserId(1));
        let mut bob = bus.subscribe(UserId(2));

        bus.publish(vec![UserId(2)], pinned(10));
        bus.publish(vec![UserId(1), UserId(2)], pinned(11));

        assert_eq!(alice.recv().await, Some(pinned(11)));
        assert_eq!(bob.recv().await, Some(pinned(10)));
        assert_eq!(bob.recv().await, Some(pinned(11)));
    }

    #[tokio::test]
    async fn lagging_feed_is_told_to_resync() {
        let bus = EventBus::new(2);
        let mut feed = bus.subscribe(UserId(1));
        for id in 0..5 {
            bus.publish(vec![UserId(1)], pinned(id));
        }

        assert_eq!(feed.recv().await, Some(ServerEvent::ResyncRequired));
        assert_eq!(feed.recv().await, Some(pinned(3)));
    }

    #[tokio::test]
    async fn burst_for_one_user_does_not_lag_another() {
        let bus = EventBus::new(2);
        let mut alice = bus.subscribe(UserId(1));
        let mut bob = bus.subscribe(UserId(2));

        bus.publish(vec![UserId(1), UserId(2)], pinned(1));
        for id in 10..20 {
            bus.publish(vec![UserId(1)], pinned(id));
        }

        assert_eq!(bob.recv().await, Some(pinned(1)));
        assert_eq!(alice.recv().await, Some(ServerEvent::ResyncRequired));
        assert_eq!(alice.recv().await, Some(pinned(18)));
    }

    #[tokio::test]
    async fn dropped_feeds_release_their_channel() {
        let bus = EventBus::new(4);
        let feed = bus.subscribe(UserId(1));
        let other = bus.subscribe(UserId(1));
        assert_eq!(bus.subscriber_count(), 2);

        drop(feed);
        assert_eq!(bus.publish(vec![UserId(1)], pinned(1)), 1);
        drop(other);
        assert_eq!(bus.publish(vec![UserId(1)], pinned(2)), 0);
        assert_eq!(bus.subscriber_count(), 0);
        assert!(bus.channels().is_empty());
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        assert_eq!(bus.publish(vec![UserId(1)], pinned(1)), 0);
        assert_eq!(bus.publish(Vec::new(), pinned(1)), 0);
    }
}
