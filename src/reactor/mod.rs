//! The event pump.
//!
//! A `Reactor` multiplexes timers, descriptor readiness and cross-thread user
//! events on a single thread. Handlers run to completion on that thread and
//! get the reactor lent to them, so they can register, reschedule, stop or
//! kill any handle (their own included) without holding on to it.
//!
//! Handles are generational tokens into the reactor's registry. A handler
//! that wants to reschedule itself uses the token it is called with; there is
//! no handle-to-handler reference to leak.
use std::collections::HashMap;
use std::fmt;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use log::{debug, error, trace, warn};

use crate::signals::Shutdown;
use crate::system::identities::Identities;
use crate::system::{ready_from, Poller, RawEvent};
use crate::{Error, Interest, Ready, Result, Token};

mod callback;
mod fds;
mod timers;
mod user;

pub use callback::{Callback, FdHandler, HandleState, Reaction, Recurrence, TimerHandler, UserHandler};
pub use user::{Payload, Remote, UserEvent};

use callback::{FdWatch, Timer, UserWatch};
use fds::FdTable;
use timers::TimerSet;
use user::{Message, UserEventQueue};

// -----------------------------------------------------------------------------
//     - Reactor builder -
// -----------------------------------------------------------------------------
/// `ReactorBuilder` shouldn't be used directly,
/// but rather through `Reactor::builder()`.
#[derive(Debug, Clone)]
pub struct ReactorBuilder {
    event_cap: Option<usize>,
    registry_cap: Option<usize>,
    max_handles: Option<usize>,
}

impl ReactorBuilder {
    /// Set the event capacity.
    /// This is the number of events that will be passed to epoll.
    pub fn with_capacity(mut self, cap: usize) -> Self {
        self.event_cap = Some(cap);
        self
    }

    /// Pre allocate the registry.
    /// This can grow unless `max_handles` is set.
    pub fn registry_cap(mut self, cap: usize) -> Self {
        self.registry_cap = Some(cap);
        self
    }

    /// Refuse registrations past this many live handles.
    pub fn max_handles(mut self, max: usize) -> Self {
        self.max_handles = Some(max);
        self
    }

    pub fn finish(self) -> Result<Reactor> {
        let event_cap = self.event_cap.unwrap_or(64);
        let registry_cap = self.registry_cap.unwrap_or(1024);
        Reactor::init(event_cap, registry_cap, self.max_handles)
    }
}

// -----------------------------------------------------------------------------
//     - Reactor -
// -----------------------------------------------------------------------------
pub struct Reactor {
    poller: Poller,
    registry: Identities<Callback>,
    timers: TimerSet,
    fds: FdTable,
    tags: HashMap<u64, Token>,
    queue: UserEventQueue,
    raw_events: Vec<RawEvent>,
    seq: u64,
    stopped: bool,
}

impl Reactor {
    /// A reactor with default settings.
    pub fn new() -> Result<Self> {
        Self::builder().finish()
    }

    /// Start creating a reactor:
    /// ```
    /// # use pumpkin::Reactor;
    /// let reactor = Reactor::builder().with_capacity(32).finish().unwrap();
    /// assert!(reactor.is_empty());
    /// ```
    pub fn builder() -> ReactorBuilder {
        ReactorBuilder {
            event_cap: None,
            registry_cap: None,
            max_handles: None,
        }
    }

    fn init(event_cap: usize, registry_cap: usize, max_handles: Option<usize>) -> Result<Self> {
        let poller = Poller::new(event_cap)?;
        let queue = UserEventQueue::new(poller.waker());

        let inst = Self {
            poller,
            registry: Identities::with_capacity(registry_cap, max_handles),
            timers: TimerSet::new(),
            fds: FdTable::new(),
            tags: HashMap::new(),
            queue,
            raw_events: Vec::with_capacity(event_cap),
            seq: 0,
            stopped: false,
        };

        Ok(inst)
    }

    /// A thread-safe handle for pushing user events and stopping the loop.
    pub fn remote(&self) -> Remote {
        self.queue.remote()
    }

    // -------------------------------------------------------------------------
    //     - Registration -
    // -------------------------------------------------------------------------
    /// Run `handler` after `delay`, then according to `recurrence`.
    pub fn register_timer<F>(&mut self, handler: F, delay: Duration, recurrence: Recurrence) -> Result<Token>
    where
        F: FnMut(&mut Reactor, Token) -> Reaction + 'static,
    {
        self.activate(Callback::timer(delay, recurrence, handler))
    }

    /// Watch `fd` for `interest`. Errors are always reported in the ready
    /// mask.
    ///
    /// A descriptor can only have one live watch; registering it again
    /// fails with `DescriptorInUse`. Use `modify_fd` to change the interest.
    pub fn register_fd<F>(&mut self, fd: RawFd, interest: Interest, handler: F) -> Result<Token>
    where
        F: FnMut(&mut Reactor, Token, Ready) -> Reaction + 'static,
    {
        self.activate(Callback::fd(fd, interest, handler))
    }

    /// Handle user events carrying `tag`. One live handler per tag.
    pub fn register_user_event<F>(&mut self, tag: u64, handler: F) -> Result<Token>
    where
        F: FnMut(&mut Reactor, Token, UserEvent) -> Reaction + 'static,
    {
        self.activate(Callback::user_event(tag, handler))
    }

    /// Register a callback, moving it from unregistered to registered.
    pub fn activate(&mut self, callback: Callback) -> Result<Token> {
        match &callback {
            Callback::Timer(_) => {}
            Callback::FdEvent(watch) => {
                if watch.fd < 0 {
                    return Err(Error::InvalidDescriptor(watch.fd));
                }
                if watch.interest.is_empty() {
                    return Err(Error::EmptyInterest(watch.fd));
                }
                if self.fds.owner(watch.fd).is_some() {
                    return Err(Error::DescriptorInUse(watch.fd));
                }
            }
            Callback::UserEvent(watch) => {
                if self.tags.contains_key(&watch.tag) {
                    return Err(Error::TagInUse(watch.tag));
                }
            }
        }

        let kind = callback.kind();
        let limit = self.registry.limit();
        let token = self.registry.reserve(callback).ok_or(Error::RegistryFull(limit))?;

        let armed = match self.registry.get_mut(token) {
            Some(Callback::Timer(timer)) => {
                self.seq += 1;
                timer.seq = self.seq;
                self.timers.insert(token, Instant::now() + timer.delay, timer.seq);
                Ok(())
            }
            Some(Callback::FdEvent(watch)) => {
                let (fd, interest) = (watch.fd, watch.interest);
                match self.poller.arm(fd, interest, token) {
                    Ok(()) => {
                        self.fds.insert(fd, token, interest);
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            Some(Callback::UserEvent(watch)) => {
                self.tags.insert(watch.tag, token);
                Ok(())
            }
            None => unreachable!("token was just reserved"),
        };

        if let Err(e) = armed {
            self.registry.free(token);
            return Err(e);
        }

        debug!("registered {} handle {:?}", kind, token);
        Ok(token)
    }

    /// Change the interest mask of a live fd watch.
    pub fn modify_fd(&mut self, token: Token, interest: Interest) -> Result<()> {
        let watch = match self.registry.get_mut(token) {
            Some(Callback::FdEvent(watch)) => watch,
            _ => return Err(Error::InvalidCommand(format!("{:?} is not a live fd watch", token))),
        };

        if interest.is_empty() {
            return Err(Error::EmptyInterest(watch.fd));
        }

        self.poller.rearm(watch.fd, interest, token)?;
        watch.interest = interest;
        self.fds.set_interest(watch.fd, interest);
        Ok(())
    }

    /// Move a live timer to `now + delay`. Its recurrence is unchanged.
    pub fn reset_timer(&mut self, token: Token, delay: Duration) -> Result<()> {
        match self.registry.get(token) {
            Some(Callback::Timer(timer)) => {
                self.timers.insert(token, Instant::now() + delay, timer.seq);
                Ok(())
            }
            _ => Err(Error::InvalidCommand(format!("{:?} is not a live timer", token))),
        }
    }

    /// Deregister `token` and drop its handler.
    ///
    /// Idempotent: returns `true` only for the call that did the work. Safe
    /// from inside any handler, including the one owning `token`.
    pub fn die(&mut self, token: Token) -> bool {
        if !self.registry.contains(token) {
            trace!("{:?} is already dead", token);
            return false;
        }

        let callback = match self.registry.free(token) {
            Some(cb) => cb,
            None => return false,
        };

        match &callback {
            Callback::Timer(_) => {
                self.timers.remove(token);
            }
            Callback::FdEvent(watch) => {
                if self.fds.is_live(watch.fd, token) {
                    // The handler may have closed the descriptor already,
                    // which drops it from epoll on its own.
                    if let Err(e) = self.poller.disarm(watch.fd) {
                        trace!("disarm {} for {:?}: {}", watch.fd, token, e);
                    }
                }
                self.fds.remove(watch.fd, token);
            }
            Callback::UserEvent(watch) => {
                if self.tags.get(&watch.tag) == Some(&token) {
                    self.tags.remove(&watch.tag);
                }
            }
        }

        debug!("{} handle {:?} is dead", callback.kind(), token);
        true
    }

    pub fn state(&self, token: Token) -> HandleState {
        match self.registry.contains(token) {
            true => HandleState::Registered,
            false => HandleState::Dead,
        }
    }

    /// Queue a user event from the reactor thread. Other threads go through
    /// `remote()`.
    pub fn push_user_event(&self, tag: u64, payload: Option<Payload>) -> Result<()> {
        self.queue.push(Message::Event(UserEvent { tag, payload }))
    }

    /// Return from `run` once the current pass is done.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Live handles of every kind.
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.len() == 0
    }

    pub fn active_timers(&self) -> usize {
        self.timers.len()
    }

    pub fn active_fds(&self) -> usize {
        self.fds.len()
    }

    /// The descriptors currently watched and their interest masks.
    pub fn watched_fds(&self) -> Vec<(RawFd, Interest)> {
        self.fds.watch_set()
    }

    // -------------------------------------------------------------------------
    //     - Loop -
    // -------------------------------------------------------------------------
    /// Dispatch until `stop` is called, `timeout` elapses (`None` means no
    /// limit) or there is nothing left that could ever fire.
    pub fn run(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.run_inner(timeout, None)
    }

    /// Like `run`, also returning once `shutdown` is cancelled.
    pub fn run_until(&mut self, timeout: Option<Duration>, shutdown: &Shutdown) -> Result<()> {
        shutdown.attach(&self.poller.waker());
        self.run_inner(timeout, Some(shutdown))
    }

    fn run_inner(&mut self, timeout: Option<Duration>, shutdown: Option<&Shutdown>) -> Result<()> {
        let end = timeout.map(|t| Instant::now() + t);
        self.stopped = false;

        loop {
            if self.stopped {
                debug!("reactor stopped");
                break;
            }

            if shutdown.map(Shutdown::is_cancelled).unwrap_or(false) {
                debug!("reactor cancelled");
                break;
            }

            if self.registry.len() == 0 && self.queue.is_empty() {
                debug!("nothing left to dispatch");
                break;
            }

            let now = Instant::now();
            if let Some(end) = end {
                if now >= end {
                    break;
                }
            }

            let until_timer = self.timers.peek_earliest().map(|d| d.saturating_duration_since(now));
            let until_end = end.map(|e| e.saturating_duration_since(now));
            let wait = match (until_timer, until_end) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };

            let mut raw_events = std::mem::take(&mut self.raw_events);
            if let Err(e) = self.poller.wait(wait, &mut raw_events) {
                error!("readiness wait failed: {}", e);
                self.raw_events = raw_events;
                return Err(Error::Runtime(e));
            }

            self.fds.begin_pass();
            self.dispatch_timers(Instant::now());
            self.dispatch_fds(&raw_events);
            self.dispatch_user_events();
            self.fds.end_pass();

            raw_events.clear();
            self.raw_events = raw_events;
        }

        Ok(())
    }

    fn dispatch_timers(&mut self, now: Instant) {
        for (token, deadline) in self.timers.pop_all_due(now) {
            // Rescheduled by an earlier handler in this pass.
            if self.timers.contains(token) {
                continue;
            }

            let mut handler = match self.registry.get_mut(token) {
                Some(Callback::Timer(Timer { handler, .. })) => match handler.take() {
                    Some(h) => h,
                    None => continue,
                },
                _ => continue,
            };

            trace!("timer {:?} fired", token);
            let reaction = handler(self, token);

            let next = match self.registry.get_mut(token) {
                Some(Callback::Timer(timer)) => {
                    timer.handler = Some(handler);
                    // A reset from inside the handler wins over the reaction.
                    if self.timers.contains(token) && reaction != Reaction::Stop {
                        continue;
                    }
                    timer.next_deadline(reaction, deadline, Instant::now()).map(|d| (d, timer.seq))
                }
                // Killed itself.
                _ => continue,
            };

            match next {
                Some((deadline, seq)) => self.timers.insert(token, deadline, seq),
                None => {
                    self.die(token);
                }
            }
        }
    }

    fn dispatch_fds(&mut self, raw_events: &[RawEvent]) {
        for raw in raw_events {
            let token = Token::from_u64(raw.data);

            let (fd, interest) = match self.registry.get(token) {
                Some(Callback::FdEvent(FdWatch { fd, interest, .. })) => (*fd, *interest),
                _ => continue,
            };

            if !self.fds.is_live(fd, token) {
                continue;
            }

            let ready = ready_from(raw.events, interest);
            if ready.is_empty() {
                continue;
            }

            let mut handler = match self.registry.get_mut(token) {
                Some(Callback::FdEvent(FdWatch { handler, .. })) => match handler.take() {
                    Some(h) => h,
                    None => continue,
                },
                _ => continue,
            };

            trace!("fd {} ready {:?} for {:?}", fd, ready, token);
            let reaction = handler(self, token, ready);

            match self.registry.get_mut(token) {
                Some(Callback::FdEvent(watch)) => watch.handler = Some(handler),
                _ => continue,
            }

            if reaction == Reaction::Stop {
                self.die(token);
            }
        }
    }

    fn dispatch_user_events(&mut self) {
        for message in self.queue.drain() {
            let event = match message {
                Message::Stop => {
                    self.stopped = true;
                    continue;
                }
                Message::Event(event) => event,
            };

            let token = match self.tags.get(&event.tag) {
                Some(token) => *token,
                None => {
                    warn!("dropping user event {} with no handler", event.tag);
                    continue;
                }
            };

            let mut handler = match self.registry.get_mut(token) {
                Some(Callback::UserEvent(UserWatch { handler, .. })) => match handler.take() {
                    Some(h) => h,
                    None => continue,
                },
                _ => continue,
            };

            trace!("user event {} for {:?}", event.tag, token);
            let reaction = handler(self, token, event);

            match self.registry.get_mut(token) {
                Some(Callback::UserEvent(watch)) => watch.handler = Some(handler),
                _ => continue,
            }

            if reaction == Reaction::Stop {
                self.die(token);
            }
        }
    }
}

// -----------------------------------------------------------------------------
//     - Debug -
// -----------------------------------------------------------------------------
impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<Reactor handles: {} timers: {} fds: {} stopped: {}>",
            self.registry.len(),
            self.timers.len(),
            self.fds.len(),
            self.stopped
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    thread_local! {
        static LOGGED_ERRORS: RefCell<usize> = RefCell::new(0);
    }

    // Counts error-level records per test thread.
    struct ErrorCounter;

    impl log::Log for ErrorCounter {
        fn enabled(&self, _: &log::Metadata) -> bool {
            true
        }

        fn log(&self, record: &log::Record) {
            if record.level() == log::Level::Error {
                LOGGED_ERRORS.with(|n| *n.borrow_mut() += 1);
            }
        }

        fn flush(&self) {}
    }

    fn count_errors() {
        static COUNTER: ErrorCounter = ErrorCounter;
        static INIT: std::sync::Once = std::sync::Once::new();
        INIT.call_once(|| {
            let _ = log::set_logger(&COUNTER);
            log::set_max_level(log::LevelFilter::Trace);
        });
    }

    fn logged_errors() -> usize {
        LOGGED_ERRORS.with(|n| *n.borrow())
    }

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let res = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        assert_eq!(res, 0);
        (fds[0], fds[1])
    }

    fn close(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    #[test]
    fn rejects_bad_fd_registrations() {
        let mut reactor = Reactor::new().unwrap();
        let noop = |_: &mut Reactor, _: Token, _: Ready| Reaction::Continue;

        match reactor.register_fd(-1, Interest::READABLE, noop) {
            Err(Error::InvalidDescriptor(-1)) => {}
            other => panic!("unexpected {:?}", other),
        }

        let (rx, tx) = pipe();
        match reactor.register_fd(rx, Interest::NONE, noop) {
            Err(Error::EmptyInterest(_)) => {}
            other => panic!("unexpected {:?}", other),
        }

        reactor.register_fd(rx, Interest::READABLE, noop).unwrap();
        match reactor.register_fd(rx, Interest::WRITABLE, noop) {
            Err(Error::DescriptorInUse(fd)) => assert_eq!(fd, rx),
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(reactor.active_fds(), 1);
        close(rx);
        close(tx);
    }

    #[test]
    fn die_is_idempotent() {
        count_errors();
        let mut reactor = Reactor::new().unwrap();
        let token = reactor
            .register_timer(|_, _| Reaction::Continue, Duration::from_secs(60), Recurrence::Once)
            .unwrap();

        assert_eq!(reactor.state(token), HandleState::Registered);
        assert_eq!(reactor.active_timers(), 1);

        assert!(reactor.die(token));
        for _ in 0..5 {
            assert!(!reactor.die(token));
        }

        assert_eq!(reactor.state(token), HandleState::Dead);
        assert_eq!(reactor.active_timers(), 0);
        assert!(reactor.is_empty());
        assert_eq!(logged_errors(), 0);
    }

    #[test]
    fn dead_slot_reuse_does_not_revive_token() {
        let mut reactor = Reactor::new().unwrap();
        let noop = |_: &mut Reactor, _: Token| Reaction::Continue;
        let first = reactor.register_timer(noop, Duration::from_secs(1), Recurrence::Once).unwrap();
        reactor.die(first);
        let second = reactor.register_timer(noop, Duration::from_secs(1), Recurrence::Once).unwrap();

        assert_eq!(reactor.state(first), HandleState::Dead);
        assert_eq!(reactor.state(second), HandleState::Registered);
        assert!(!reactor.die(first));
        assert_eq!(reactor.state(second), HandleState::Registered);
    }

    #[test]
    fn one_handler_per_tag() {
        let mut reactor = Reactor::new().unwrap();
        let noop = |_: &mut Reactor, _: Token, _: UserEvent| Reaction::Continue;
        let token = reactor.register_user_event(3, noop).unwrap();

        match reactor.register_user_event(3, noop) {
            Err(Error::TagInUse(3)) => {}
            other => panic!("unexpected {:?}", other),
        }

        reactor.die(token);
        reactor.register_user_event(3, noop).unwrap();
    }

    #[test]
    fn registry_limit() {
        let mut reactor = Reactor::builder().max_handles(1).finish().unwrap();
        let noop = |_: &mut Reactor, _: Token| Reaction::Continue;
        reactor.register_timer(noop, Duration::from_secs(1), Recurrence::Once).unwrap();

        match reactor.register_timer(noop, Duration::from_secs(1), Recurrence::Once) {
            Err(Error::RegistryFull(1)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn stop_dispatches_once_and_kills_the_handle() {
        let mut reactor = Reactor::new().unwrap();
        let hits = Rc::new(RefCell::new(0));
        let h = hits.clone();

        let token = reactor
            .register_timer(
                move |_, _| {
                    *h.borrow_mut() += 1;
                    Reaction::Stop
                },
                Duration::from_millis(1),
                Recurrence::Every(Duration::from_millis(1)),
            )
            .unwrap();

        reactor.run(Some(Duration::from_millis(50))).unwrap();
        assert_eq!(*hits.borrow(), 1);
        assert_eq!(reactor.state(token), HandleState::Dead);
        assert_eq!(reactor.active_timers(), 0);
    }

    #[test]
    fn handler_can_kill_itself() {
        let mut reactor = Reactor::new().unwrap();
        let hits = Rc::new(RefCell::new(0));
        let h = hits.clone();

        let token = reactor
            .register_timer(
                move |reactor, me| {
                    *h.borrow_mut() += 1;
                    assert!(reactor.die(me));
                    assert!(!reactor.die(me));
                    Reaction::Continue
                },
                Duration::from_millis(1),
                Recurrence::Every(Duration::from_millis(1)),
            )
            .unwrap();

        reactor.run(Some(Duration::from_millis(30))).unwrap();
        assert_eq!(*hits.borrow(), 1);
        assert_eq!(reactor.state(token), HandleState::Dead);
    }

    #[test]
    fn fd_handler_sees_readable_and_stops() {
        let mut reactor = Reactor::new().unwrap();
        let (rx, tx) = pipe();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();

        let token = reactor
            .register_fd(rx, Interest::READABLE, move |_, _, ready| {
                let mut buf = [0u8; 16];
                let n = unsafe { libc::read(rx, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
                s.borrow_mut().push((ready.is_readable(), n));
                Reaction::Stop
            })
            .unwrap();

        let n = unsafe { libc::write(tx, b"hi".as_ptr() as *const libc::c_void, 2) };
        assert_eq!(n, 2);

        reactor.run(Some(Duration::from_millis(200))).unwrap();
        assert_eq!(*seen.borrow(), vec![(true, 2)]);
        assert_eq!(reactor.state(token), HandleState::Dead);
        assert_eq!(reactor.active_fds(), 0);

        close(rx);
        close(tx);
    }

    #[test]
    fn handler_closing_another_watch_mid_pass() {
        let mut reactor = Reactor::new().unwrap();
        let (rx_a, tx_a) = pipe();
        let (rx_b, tx_b) = pipe();
        let hits = Rc::new(RefCell::new(0));

        let other: Rc<RefCell<Option<Token>>> = Rc::new(RefCell::new(None));

        let (h, o) = (hits.clone(), other.clone());
        let a = reactor
            .register_fd(rx_a, Interest::READABLE, move |reactor, _, _| {
                *h.borrow_mut() += 1;
                if let Some(b) = o.borrow_mut().take() {
                    reactor.die(b);
                }
                Reaction::Stop
            })
            .unwrap();

        let h = hits.clone();
        let b = reactor
            .register_fd(rx_b, Interest::READABLE, move |reactor, _, _| {
                *h.borrow_mut() += 1;
                reactor.die(a);
                Reaction::Stop
            })
            .unwrap();
        *other.borrow_mut() = Some(b);

        for fd in &[tx_a, tx_b] {
            unsafe { libc::write(*fd, b"x".as_ptr() as *const libc::c_void, 1) };
        }

        reactor.run(Some(Duration::from_millis(100))).unwrap();

        // Whichever ran first killed the other before it was dispatched.
        assert_eq!(*hits.borrow(), 1);
        assert_eq!(reactor.active_fds(), 0);
        assert!(reactor.watched_fds().is_empty());

        for fd in &[rx_a, tx_a, rx_b, tx_b] {
            close(*fd);
        }
    }

    #[test]
    fn modify_fd_changes_interest() {
        let mut reactor = Reactor::new().unwrap();
        let (rx, tx) = pipe();
        let token = reactor
            .register_fd(tx, Interest::READABLE, |_, _, ready| {
                assert!(ready.is_writable());
                Reaction::Stop
            })
            .unwrap();

        reactor.modify_fd(token, Interest::WRITABLE).unwrap();
        assert_eq!(reactor.watched_fds(), vec![(tx, Interest::WRITABLE)]);

        reactor.run(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(reactor.state(token), HandleState::Dead);

        close(rx);
        close(tx);
    }

    #[test]
    fn run_returns_when_nothing_is_registered() {
        let mut reactor = Reactor::new().unwrap();
        let start = Instant::now();
        reactor.run(None).unwrap();
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn stop_from_a_handler() {
        let mut reactor = Reactor::new().unwrap();
        reactor
            .register_timer(
                |reactor, _| {
                    reactor.stop();
                    Reaction::Continue
                },
                Duration::from_millis(5),
                Recurrence::Every(Duration::from_millis(5)),
            )
            .unwrap();

        let start = Instant::now();
        reactor.run(Some(Duration::from_secs(5))).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(reactor.is_stopped());
        assert_eq!(reactor.active_timers(), 1);
    }

    #[test]
    fn user_event_payload_moves_to_the_handler() {
        let mut reactor = Reactor::new().unwrap();
        let got = Rc::new(RefCell::new(None));
        let g = got.clone();

        reactor
            .register_user_event(9, move |_, _, mut event| {
                *g.borrow_mut() = event.take::<String>();
                Reaction::Stop
            })
            .unwrap();

        reactor.push_user_event(9, Some(Box::new(String::from("hello")))).unwrap();
        reactor.run(Some(Duration::from_millis(100))).unwrap();

        assert_eq!(got.borrow().as_deref(), Some("hello"));
        assert!(reactor.is_empty());
    }
}
