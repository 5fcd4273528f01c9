use std::collections::VecDeque;

use crate::sink::ViewerId;

struct Outbound<T> {
    /// Distribution tick the viewer connected on, if we saw it happen.
    connected_at: Option<u64>,
    queue: VecDeque<T>,
}
impl<T> Default for Outbound<T> {
    fn default() -> Self {
        Self {
            connected_at: None,
            queue: VecDeque::new(),
        }
    }
}

/// Per-viewer outbound queues, drained a fixed number of items per viewer per tick.
pub struct RateLimiter<T> {
    /// `None` for unlimited.
    rate: Option<usize>,
    grace: u64,
    viewers: hashbrown::HashMap<ViewerId, Outbound<T>>,
}

impl<T> RateLimiter<T> {
    /// A negative `rate` means unlimited. Viewers receive nothing for `grace` ticks after connecting.
    #[must_use]
    pub fn new(rate: i32, grace: u64) -> Self {
        Self {
            rate: usize::try_from(rate).ok(),
            grace,
            viewers: hashbrown::HashMap::new(),
        }
    }
    #[must_use]
    pub fn rate(&self) -> Option<usize> {
        self.rate
    }
    pub fn connect(&mut self, viewer: ViewerId, now: u64) {
        self.viewers.entry(viewer).or_default().connected_at = Some(now);
    }
    /// Forget a viewer. Returns the number of items dropped from its queue.
    pub fn disconnect(&mut self, viewer: ViewerId) -> usize {
        self.viewers
            .remove(&viewer)
            .map_or(0, |outbound| outbound.queue.len())
    }
    #[must_use]
    pub fn in_grace(&self, viewer: ViewerId, now: u64) -> bool {
        self.viewers
            .get(&viewer)
            .and_then(|outbound| outbound.connected_at)
            .is_some_and(|connected| now < connected.saturating_add(self.grace))
    }
    pub fn enqueue(&mut self, viewer: ViewerId, item: T) {
        self.viewers.entry(viewer).or_default().queue.push_back(item);
    }
    #[must_use]
    pub fn queued(&self, viewer: ViewerId) -> usize {
        self.viewers
            .get(&viewer)
            .map_or(0, |outbound| outbound.queue.len())
    }
    /// Drop queued items for which `keep` returns false.
    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) {
        for outbound in self.viewers.values_mut() {
            outbound.queue.retain(|item| keep(item));
        }
    }
    /// Take this tick's allowance of items from every viewer out of its grace period.
    ///
    /// Viewers left with nothing queued and no grace period to wait out are forgotten.
    pub fn drain(&mut self, now: u64) -> Vec<(ViewerId, T)> {
        let grace = self.grace;
        let in_grace = |connected_at: Option<u64>| {
            connected_at.is_some_and(|connected| now < connected.saturating_add(grace))
        };
        let mut out = Vec::new();
        for (viewer, outbound) in &mut self.viewers {
            if in_grace(outbound.connected_at) {
                continue;
            }
            let take = self
                .rate
                .map_or(outbound.queue.len(), |rate| rate.min(outbound.queue.len()));
            out.extend(outbound.queue.drain(..take).map(|item| (*viewer, item)));
        }
        self.viewers
            .retain(|_, outbound| !outbound.queue.is_empty() || in_grace(outbound.connected_at));
        out
    }
}
