//! Fire-and-forget progress notification for UI layers.
//!
//! Refresh sessions report through a [`ProgressSink`]; nothing in the
//! engine ever waits on one.  [`ProgressDispatcher`] is the standard way
//! to mount a real sink: events go into a bounded channel drained by one
//! dedicated task, so a given sink is never called concurrently and a slow
//! sink can never stall a refresh — when the channel is full, events are
//! dropped.

use n0_future::task::{self, AbortOnDropHandle};
use tokio::sync::mpsc;
use tracing::debug;
use warren_base::{ChannelKey, ContentId};

/// Observer of refresh progress.  All methods default to no-ops so sinks
/// implement only what they display.
pub trait ProgressSink: Send + Sync + 'static {
    /// A followee's refresh status changed; `None` clears it.
    fn set_status(&self, _key: ChannelKey, _message: Option<String>) {}

    /// A cached element became visible.
    fn element_appeared(&self, _cid: ContentId) {}

    /// A cached element is gone.
    fn element_disappeared(&self, _cid: ContentId) {}
}

/// A sink that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullProgress;

impl ProgressSink for NullProgress {}

#[derive(Debug)]
enum Event {
    Status(ChannelKey, Option<String>),
    Appeared(ContentId),
    Disappeared(ContentId),
}

/// Decouples event producers from a possibly slow sink.
///
/// Dropping the dispatcher aborts the dispatch task.
#[derive(Debug)]
pub struct ProgressDispatcher {
    events: mpsc::Sender<Event>,
    _task: AbortOnDropHandle<()>,
}

impl ProgressDispatcher {
    /// Spawns the dispatch task for `sink`.
    pub fn spawn(sink: impl ProgressSink) -> Self {
        let (events, mut rx) = mpsc::channel(64);
        let task = task::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    Event::Status(key, message) => sink.set_status(key, message),
                    Event::Appeared(cid) => sink.element_appeared(cid),
                    Event::Disappeared(cid) => sink.element_disappeared(cid),
                }
            }
        });
        Self {
            events,
            _task: AbortOnDropHandle::new(task),
        }
    }

    fn send(&self, event: Event) {
        if self.events.try_send(event).is_err() {
            // fire and forget: a backlogged sink loses events rather than
            // slowing a refresh down
            debug!("progress sink backlogged, dropping event");
        }
    }
}

impl ProgressSink for ProgressDispatcher {
    fn set_status(&self, key: ChannelKey, message: Option<String>) {
        self.send(Event::Status(key, message));
    }

    fn element_appeared(&self, cid: ContentId) {
        self.send(Event::Appeared(cid));
    }

    fn element_disappeared(&self, cid: ContentId) {
        self.send(Event::Disappeared(cid));
    }
}
