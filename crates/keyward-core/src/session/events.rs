use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::model::InvalidReason;

/// Notification sent to the host when a session ends without being asked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The inactivity timer fired.
    AutoLogout { reason: InvalidReason },
    /// A validity check, resume or rejected credential ended the session.
    SessionInvalid { reason: InvalidReason },
}

impl SessionEvent {
    pub fn reason(&self) -> InvalidReason {
        match self {
            SessionEvent::AutoLogout { reason } | SessionEvent::SessionInvalid { reason } => *reason,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    AutoLogout,
    SessionInvalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Handler = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Registered event handlers.
///
/// Handlers run synchronously on the task that ended the session, in
/// registration order, after the session lock has been released. Each
/// occurrence is delivered once.
#[derive(Default)]
pub struct Listeners {
    handlers: Mutex<Vec<(ListenerId, Channel, Handler)>>,
    next_id: AtomicU64,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_auto_logout(&self, handler: impl Fn(&SessionEvent) + Send + Sync + 'static) -> ListenerId {
        self.register(Channel::AutoLogout, Arc::new(handler))
    }

    pub fn on_session_invalid(
        &self,
        handler: impl Fn(&SessionEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.register(Channel::SessionInvalid, Arc::new(handler))
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        let before = handlers.len();
        handlers.retain(|(handler_id, _, _)| *handler_id != id);
        handlers.len() != before
    }

    fn register(&self, channel: Channel, handler: Handler) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, channel, handler));
        id
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        let channel = match event {
            SessionEvent::AutoLogout { .. } => Channel::AutoLogout,
            SessionEvent::SessionInvalid { .. } => Channel::SessionInvalid,
        };
        // snapshot so handlers may register or remove listeners themselves
        let handlers: Vec<Handler> = self
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, c, _)| *c == channel)
            .map(|(_, _, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler(&event);
        }
    }
}
