//! Event fan-out to subscribers.

use std::fmt;

/// A list of subscriber channels for one event type.
///
/// Senders whose receiver has been dropped are pruned on the next send.
/// Channels are unbounded: events are dispatched from within the store's
/// update path and must never be dropped under a burst of updates.
pub(crate) struct Subscribers<E>(Vec<flume::Sender<E>>);

impl<E> Default for Subscribers<E> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<E: Clone> Subscribers<E> {
    pub(crate) fn subscribe(&mut self) -> flume::Receiver<E> {
        let (tx, rx) = flume::unbounded();
        self.0.push(tx);
        rx
    }

    pub(crate) fn send(&mut self, event: E) {
        self.0.retain(|sender| sender.send(event.clone()).is_ok());
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }
}

impl<E> fmt::Debug for Subscribers<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Subscribers").field(&self.0.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_receivers_are_pruned() {
        let mut subscribers = Subscribers::default();
        let a = subscribers.subscribe();
        let b = subscribers.subscribe();
        drop(a);
        subscribers.send(1u32);
        assert_eq!(subscribers.len(), 1);
        assert_eq!(b.try_recv(), Ok(1));
        drop(b);
        subscribers.send(2u32);
        assert_eq!(subscribers.len(), 0);
    }
}
