use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::system::evented::Evented;
use crate::{Error, Result};

/// Application data moved through the queue to exactly one handler.
pub type Payload = Box<dyn Any + Send>;

// -----------------------------------------------------------------------------
//     - UserEvent -
// -----------------------------------------------------------------------------
pub struct UserEvent {
    pub tag: u64,
    pub payload: Option<Payload>,
}

impl UserEvent {
    /// Take the payload out as a `T`. Leaves the payload in place if it is
    /// some other type.
    pub fn take<T: Any>(&mut self) -> Option<T> {
        let payload = self.payload.take()?;
        match payload.downcast::<T>() {
            Ok(val) => Some(*val),
            Err(other) => {
                self.payload = Some(other);
                None
            }
        }
    }
}

impl fmt::Debug for UserEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<UserEvent {} payload: {}>", self.tag, self.payload.is_some())
    }
}

pub(crate) enum Message {
    Event(UserEvent),
    Stop,
}

// -----------------------------------------------------------------------------
//     - Queue -
// -----------------------------------------------------------------------------
/// Pending cross-thread messages plus the eventfd that wakes the reactor.
pub(crate) struct UserEventQueue {
    tx: Sender<Message>,
    rx: Receiver<Message>,
    waker: Arc<Evented>,
}

impl UserEventQueue {
    pub(crate) fn new(waker: Arc<Evented>) -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx, waker }
    }

    pub(crate) fn remote(&self) -> Remote {
        Remote {
            tx: self.tx.clone(),
            waker: Arc::clone(&self.waker),
        }
    }

    pub(crate) fn push(&self, message: Message) -> Result<()> {
        send(&self.tx, &self.waker, message)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Take everything queued right now. Messages pushed while the batch is
    /// being dispatched wait for the next pass.
    pub(crate) fn drain(&self) -> Vec<Message> {
        let count = self.rx.len();
        self.rx.try_iter().take(count).collect()
    }
}

fn send(tx: &Sender<Message>, waker: &Evented, message: Message) -> Result<()> {
    tx.send(message).map_err(|_| Error::ReactorGone)?;
    waker.poke()?;
    Ok(())
}

// -----------------------------------------------------------------------------
//     - Remote -
// -----------------------------------------------------------------------------
/// A `Send + Clone` handle onto a reactor, usable from any thread.
///
/// This is the only way to reach a reactor from a foreign thread. Every other
/// reactor operation, `die` included, must run on the reactor thread.
#[derive(Clone)]
pub struct Remote {
    tx: Sender<Message>,
    waker: Arc<Evented>,
}

impl Remote {
    /// Queue a user event and wake the reactor.
    ///
    /// Fails with `ReactorGone` once the reactor has been dropped.
    pub fn push_user_event(&self, tag: u64, payload: Option<Payload>) -> Result<()> {
        send(&self.tx, &self.waker, Message::Event(UserEvent { tag, payload }))
    }

    /// Ask the reactor to return from `run` after the current pass.
    pub fn stop(&self) -> Result<()> {
        send(&self.tx, &self.waker, Message::Stop)
    }
}

impl fmt::Debug for Remote {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<Remote pending: {}>", self.tx.len())
    }
}
