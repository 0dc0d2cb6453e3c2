use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Which deadline a timer is tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    NegotiationTimeout,
    SmallerTimeout,
    LargerTimeout,
}

/// The message delivered back into the engine's own inbox when a timer
/// expires. `key` is the asset (negotiation) or the confirmation key
/// (confirmation controller), serialized to a string.
#[derive(Debug, Clone)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub key: String,
}

/// An explicit timer service keyed by (kind, id) with cancel-on-resolve, so
/// an armed deadline can be looked up and aborted instead of living only as
/// an ambient `tokio::time::sleep`. Every fire re-enters the engine's single
/// serialized inbox as message `T`, so a timer racing a human response
/// simply finds no matching state and no-ops.
pub struct TimerService<T: Send + 'static> {
    sender: mpsc::Sender<T>,
    build: fn(TimerFired) -> T,
    handles: HashMap<(TimerKind, String), JoinHandle<()>>,
}

impl<T: Send + 'static> TimerService<T> {
    pub fn new(sender: mpsc::Sender<T>, build: fn(TimerFired) -> T) -> Self {
        Self {
            sender,
            build,
            handles: HashMap::new(),
        }
    }

    /// Arms a timer, cancelling any existing timer of the same (kind, key)
    /// first — rearming always replaces rather than stacks.
    pub fn arm(&mut self, kind: TimerKind, key: impl Into<String>, duration: Duration) {
        let key = key.into();
        self.cancel(kind, &key);

        let sender = self.sender.clone();
        let build = self.build;
        let fired_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = sender.send(build(TimerFired { kind, key: fired_key })).await;
        });

        self.handles.insert((kind, key), handle);
    }

    /// Cancels a timer if armed; a no-op if it already fired or was never
    /// armed. Called on every terminal path of a state machine.
    pub fn cancel(&mut self, kind: TimerKind, key: &str) {
        if let Some(handle) = self.handles.remove(&(kind, key.to_string())) {
            handle.abort();
        }
    }
}
