use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Fans one producer out to any number of subscribers.
///
/// Every subscriber gets its own unbounded queue, so a slow reader never makes
/// another subscriber miss an event. Subscribers only see events published
/// after they subscribed, except for the latest value when the multicast was
/// built with [`Multicast::replaying_last`].
pub struct Multicast<T> {
    inner: Arc<Mutex<State<T>>>,
}

struct State<T> {
    subscribers: Vec<mpsc::UnboundedSender<T>>,
    last: Option<T>,
    replay_last: bool,
    finished: bool,
}

impl<T> Clone for Multicast<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Multicast<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Multicast<T> {
    pub fn new() -> Self {
        Self::with_replay(false)
    }

    /// New subscribers immediately receive the most recently published value.
    pub fn replaying_last() -> Self {
        Self::with_replay(true)
    }

    fn with_replay(replay_last: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(State {
                subscribers: Vec::new(),
                last: None,
                replay_last,
                finished: false,
            })),
        }
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.lock();
        if let Some(last) = state.last.clone() {
            let _ = tx.send(last);
        }
        if !state.finished {
            state.subscribers.push(tx);
        }
        Subscription { rx }
    }

    /// Delivers `value` to every live subscriber and returns how many got it.
    pub fn publish(&self, value: T) -> usize {
        let mut state = self.inner.lock();
        if state.finished {
            return 0;
        }
        if state.replay_last {
            state.last = Some(value.clone());
        }
        state.subscribers.retain(|tx| tx.send(value.clone()).is_ok());
        state.subscribers.len()
    }

    /// Ends every subscription once its queue drains. Later publishes are dropped.
    pub fn finish(&self) {
        let mut state = self.inner.lock();
        state.finished = true;
        state.subscribers.clear();
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock().finished
    }

    pub fn latest(&self) -> Option<T> {
        self.inner.lock().last.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        let mut state = self.inner.lock();
        state.subscribers.retain(|tx| !tx.is_closed());
        state.subscribers.len()
    }
}

/// One subscriber's view of a [`Multicast`].
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let multicast = Multicast::new();
        let mut first = multicast.subscribe();
        let mut second = multicast.subscribe();

        for value in 0..100u32 {
            assert_eq!(multicast.publish(value), 2);
        }
        multicast.finish();

        let a: Vec<u32> = (&mut first).collect().await;
        let b: Vec<u32> = second.by_ref().collect().await;
        assert_eq!(a, (0..100).collect::<Vec<_>>());
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_events() {
        let multicast = Multicast::new();
        multicast.publish("early");
        let mut late = multicast.subscribe();
        multicast.publish("late");
        assert_eq!(late.recv().await, Some("late"));
        assert_eq!(late.try_recv(), None);
    }

    #[tokio::test]
    async fn replaying_multicast_hands_latest_to_new_subscribers() {
        let multicast = Multicast::replaying_last();
        multicast.publish(1);
        multicast.publish(2);
        let mut sub = multicast.subscribe();
        assert_eq!(sub.recv().await, Some(2));

        multicast.finish();
        let mut after_finish = multicast.subscribe();
        assert_eq!(after_finish.recv().await, Some(2));
        assert_eq!(after_finish.recv().await, None);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let multicast = Multicast::new();
        let sub = multicast.subscribe();
        let _kept = multicast.subscribe();
        drop(sub);
        assert_eq!(multicast.publish(()), 1);
        assert_eq!(multicast.subscriber_count(), 1);
    }
}
