//! The dispatcher: one event loop per worker thread.

use crate::file_event::{FileEvent, FileReadyType, TriggerType};
use crate::signal::SignalEvent;
use crate::timer::Timer;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use slab::Slab;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

/// Token reserved for the cross-thread waker.
const WAKER_TOKEN: Token = Token(usize::MAX);

/// How [`Dispatcher::run`] behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunType {
    /// Run a single non-blocking iteration and return.
    NonBlock,
    /// Run until there are no registered events, armed timers, or pending
    /// posts, or until `exit` is called.
    Block,
    /// Run until `exit` is called.
    RunUntilExit,
}

type PostCallback = Box<dyn FnOnce() + Send>;

struct PostQueue {
    queue: Mutex<VecDeque<PostCallback>>,
}

/// Cloneable, `Send` handle for posting work to the loop from other threads.
#[derive(Clone)]
pub struct DispatcherHandle {
    posts: Arc<PostQueue>,
    waker: Arc<Waker>,
    exit: Arc<AtomicBool>,
}

impl DispatcherHandle {
    /// Queue a callback to run on the dispatcher thread. Callbacks posted
    /// from one thread run in FIFO order, after the current iteration's I/O
    /// callbacks have returned. Never fails.
    pub fn post(&self, callback: impl FnOnce() + Send + 'static) {
        self.posts.queue.lock().push_back(Box::new(callback));
        // A failed wake means the poll instance is gone and the loop has
        // already exited; the callback is dropped with the queue.
        let _ = self.waker.wake();
    }

    /// Ask the loop to exit once the current iteration completes.
    pub fn exit(&self) {
        self.exit.store(true, Ordering::Release);
        let _ = self.waker.wake();
    }
}

struct FileReg {
    fd: RawFd,
    events: u32,
    trigger: TriggerType,
    cb: Rc<RefCell<dyn FnMut(u32)>>,
}

struct TimerEntry {
    cb: Rc<RefCell<dyn FnMut()>>,
    deadline: Option<Instant>,
    generation: u64,
}

pub(crate) struct Inner {
    poll: RefCell<Poll>,
    events: RefCell<Events>,
    files: RefCell<Slab<FileReg>>,
    timers: RefCell<Slab<TimerEntry>>,
    // (deadline, generation, key); stale entries are skipped on pop.
    timer_heap: RefCell<BinaryHeap<Reverse<(Instant, u64, usize)>>>,
    // Synthetic and level-trigger re-deliveries for the next iteration.
    activations: RefCell<VecDeque<(usize, u32)>>,
    posts: Arc<PostQueue>,
    waker: Arc<Waker>,
    exit: Arc<AtomicBool>,
    to_delete: [RefCell<Vec<Box<dyn Any>>>; 2],
    delete_current: Cell<usize>,
    deferred_deleting: Cell<bool>,
    drain_timer_key: Cell<usize>,
}

/// The event loop bound to one worker thread.
///
/// Not `Send`: all state is thread-local to the owning thread. Cross-thread
/// interaction goes through [`DispatcherHandle`].
pub struct Dispatcher {
    inner: Rc<Inner>,
}

impl Dispatcher {
    pub fn new() -> Dispatcher {
        let poll = Poll::new().expect("event loop creation failed");
        let waker =
            Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).expect("event registration failed"));

        let inner = Rc::new(Inner {
            poll: RefCell::new(poll),
            events: RefCell::new(Events::with_capacity(1024)),
            files: RefCell::new(Slab::with_capacity(64)),
            timers: RefCell::new(Slab::with_capacity(16)),
            timer_heap: RefCell::new(BinaryHeap::new()),
            activations: RefCell::new(VecDeque::new()),
            posts: Arc::new(PostQueue {
                queue: Mutex::new(VecDeque::new()),
            }),
            waker,
            exit: Arc::new(AtomicBool::new(false)),
            to_delete: [RefCell::new(Vec::new()), RefCell::new(Vec::new())],
            delete_current: Cell::new(0),
            deferred_deleting: Cell::new(false),
            drain_timer_key: Cell::new(usize::MAX),
        });

        // Internal one-shot timer that drains the deferred-delete list after
        // the callback that queued the first item has returned.
        let weak = Rc::downgrade(&inner);
        let key = inner.insert_timer(Rc::new(RefCell::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.clear_deferred_delete_list();
            }
        })));
        inner.drain_timer_key.set(key);

        Dispatcher { inner }
    }

    /// Handle for posting callbacks from other threads.
    pub fn handle(&self) -> DispatcherHandle {
        DispatcherHandle {
            posts: self.inner.posts.clone(),
            waker: self.inner.waker.clone(),
            exit: self.inner.exit.clone(),
        }
    }

    /// Register a callback for readiness on `fd`.
    ///
    /// The callback runs on the dispatcher thread whenever any requested
    /// event is ready. Registration failures are fatal.
    pub fn create_file_event(
        &self,
        fd: RawFd,
        cb: impl FnMut(u32) + 'static,
        trigger: TriggerType,
        events: u32,
    ) -> FileEvent {
        let mut files = self.inner.files.borrow_mut();
        let entry = files.vacant_entry();
        let key = entry.key();

        self.inner
            .poll
            .borrow()
            .registry()
            .register(&mut SourceFd(&fd), Token(key), interest_for(events))
            .expect("event registration failed");

        entry.insert(FileReg {
            fd,
            events,
            trigger,
            cb: Rc::new(RefCell::new(cb)),
        });

        FileEvent {
            inner: Rc::downgrade(&self.inner),
            key,
            fd,
        }
    }

    /// Create a one-shot timer. Armed with [`Timer::enable`].
    pub fn create_timer(&self, cb: impl FnMut() + 'static) -> Timer {
        let key = self.inner.insert_timer(Rc::new(RefCell::new(cb)));
        Timer {
            inner: Rc::downgrade(&self.inner),
            key,
        }
    }

    /// Run a callback when `signum` is delivered to the process.
    pub fn listen_for_signal(&self, signum: i32, cb: impl FnMut() + 'static) -> SignalEvent {
        SignalEvent::new(self, signum, cb)
    }

    /// Queue a callback from this thread. See [`DispatcherHandle::post`].
    pub fn post(&self, callback: impl FnOnce() + Send + 'static) {
        self.handle().post(callback);
    }

    /// Schedule `item` for destruction after the current callback returns.
    ///
    /// Items queued while a drain is in progress are destroyed on the next
    /// loop iteration, never inline.
    pub fn deferred_delete(&self, item: Box<dyn Any>) {
        let inner = &self.inner;
        let current = inner.delete_current.get();
        let mut list = inner.to_delete[current].borrow_mut();
        list.push(item);
        trace!(size = list.len(), "item added to deferred deletion list");
        if list.len() == 1 {
            inner.enable_timer(inner.drain_timer_key.get(), Duration::ZERO);
        }
    }

    /// Synchronously destroy everything queued for deferred deletion. Used
    /// at shutdown.
    pub fn clear_deferred_delete_list(&self) {
        self.inner.clear_deferred_delete_list();
    }

    /// Run the loop. Blocks the calling thread until the run type's exit
    /// condition is met.
    pub fn run(&self, run_type: RunType) {
        loop {
            // Block mode exits once nothing can generate another event.
            if run_type == RunType::Block && !self.inner.has_work() {
                break;
            }
            let keep_going = self.inner.run_once(run_type);
            match run_type {
                RunType::NonBlock => break,
                RunType::Block | RunType::RunUntilExit => {
                    if !keep_going {
                        break;
                    }
                }
            }
        }
    }

    /// Ask the loop to exit. Safe to call from the loop's own callbacks.
    pub fn exit(&self) {
        self.inner.exit.store(true, Ordering::Release);
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn run_once(&self, run_type: RunType) -> bool {
        self.run_post_callbacks();
        if self.exit.load(Ordering::Acquire) {
            return false;
        }

        let timeout = if run_type == RunType::NonBlock || !self.activations.borrow().is_empty() {
            Some(Duration::ZERO)
        } else {
            self.next_timer_timeout()
        };

        {
            let mut poll = self.poll.borrow_mut();
            let mut events = self.events.borrow_mut();
            match poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => panic!("event loop poll failed: {}", e),
            }
        }

        // Collect readiness before dispatching so callbacks are free to
        // register and deregister events.
        let mut ready: Vec<(usize, u32)> = Vec::new();
        for event in self.events.borrow().iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            let mut mask = 0;
            if event.is_readable() {
                mask |= FileReadyType::READ;
            }
            if event.is_writable() {
                mask |= FileReadyType::WRITE;
            }
            if event.is_read_closed() || event.is_write_closed() || event.is_error() {
                mask |= FileReadyType::CLOSED;
            }
            ready.push((event.token().0, mask));
        }

        let activations = std::mem::take(&mut *self.activations.borrow_mut());
        for (key, mask) in activations {
            self.dispatch_file(key, mask);
        }
        for (key, mask) in ready {
            self.dispatch_file(key, mask);
        }

        self.fire_timers();
        self.run_post_callbacks();

        !self.exit.load(Ordering::Acquire)
    }

    fn dispatch_file(&self, key: usize, mask: u32) {
        let Some((cb, trigger, wanted)) = self
            .files
            .borrow()
            .get(key)
            .map(|reg| (reg.cb.clone(), reg.trigger, reg.events))
        else {
            return;
        };
        let mask = mask & wanted;
        if mask == 0 || wanted == 0 {
            return;
        }

        (cb.borrow_mut())(mask);

        // Level-triggered events keep firing until disabled or re-armed.
        if trigger == TriggerType::Level
            && let Some(reg) = self.files.borrow().get(key)
            && reg.events != 0
        {
            self.activations.borrow_mut().push_back((key, mask));
        }
    }

    pub(crate) fn activate_file(&self, key: usize, events: u32) {
        self.activations.borrow_mut().push_back((key, events));
        let _ = self.waker.wake();
    }

    pub(crate) fn set_file_enabled(&self, key: usize, fd: RawFd, events: u32) {
        let mut files = self.files.borrow_mut();
        let Some(reg) = files.get_mut(key) else {
            return;
        };
        reg.events = events;
        let registry = self.poll.borrow();
        let registry = registry.registry();
        if events == 0 {
            let _ = registry.deregister(&mut SourceFd(&fd));
        } else {
            registry
                .reregister(&mut SourceFd(&fd), Token(key), interest_for(events))
                .or_else(|_| registry.register(&mut SourceFd(&fd), Token(key), interest_for(events)))
                .expect("event registration failed");
        }
    }

    pub(crate) fn remove_file(&self, key: usize, fd: RawFd) {
        if self.files.borrow_mut().try_remove(key).is_some() {
            let _ = self
                .poll
                .borrow()
                .registry()
                .deregister(&mut SourceFd(&fd));
        }
    }

    fn insert_timer(&self, cb: Rc<RefCell<dyn FnMut()>>) -> usize {
        self.timers.borrow_mut().insert(TimerEntry {
            cb,
            deadline: None,
            generation: 0,
        })
    }

    pub(crate) fn enable_timer(&self, key: usize, duration: Duration) {
        let mut timers = self.timers.borrow_mut();
        let Some(entry) = timers.get_mut(key) else {
            return;
        };
        let deadline = Instant::now() + duration;
        entry.generation += 1;
        entry.deadline = Some(deadline);
        self.timer_heap
            .borrow_mut()
            .push(Reverse((deadline, entry.generation, key)));
    }

    pub(crate) fn disable_timer(&self, key: usize) {
        if let Some(entry) = self.timers.borrow_mut().get_mut(key) {
            entry.generation += 1;
            entry.deadline = None;
        }
    }

    pub(crate) fn timer_enabled(&self, key: usize) -> bool {
        self.timers
            .borrow()
            .get(key)
            .is_some_and(|e| e.deadline.is_some())
    }

    pub(crate) fn remove_timer(&self, key: usize) {
        self.timers.borrow_mut().try_remove(key);
    }

    fn next_timer_timeout(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut heap = self.timer_heap.borrow_mut();
        let timers = self.timers.borrow();
        while let Some(Reverse((deadline, generation, key))) = heap.peek().copied() {
            let live = timers
                .get(key)
                .is_some_and(|e| e.generation == generation && e.deadline == Some(deadline));
            if live {
                return Some(deadline.saturating_duration_since(now));
            }
            heap.pop();
        }
        None
    }

    fn fire_timers(&self) {
        let now = Instant::now();
        loop {
            let cb = {
                let mut heap = self.timer_heap.borrow_mut();
                let mut timers = self.timers.borrow_mut();
                let Some(Reverse((deadline, generation, key))) = heap.peek().copied() else {
                    break;
                };
                if deadline > now {
                    break;
                }
                heap.pop();
                match timers.get_mut(key) {
                    Some(entry)
                        if entry.generation == generation && entry.deadline == Some(deadline) =>
                    {
                        entry.deadline = None;
                        entry.cb.clone()
                    }
                    // Stale heap entry for a re-armed, disabled, or removed
                    // timer.
                    _ => continue,
                }
            };
            (cb.borrow_mut())();
        }
    }

    fn run_post_callbacks(&self) {
        loop {
            let Some(cb) = self.posts.queue.lock().pop_front() else {
                break;
            };
            cb();
        }
    }

    fn clear_deferred_delete_list(&self) {
        if self.deferred_deleting.get() {
            return;
        }
        let current = self.delete_current.get();
        let num_to_delete = self.to_delete[current].borrow().len();
        if num_to_delete == 0 {
            return;
        }

        trace!(size = num_to_delete, "clearing deferred deletion list");

        // Flip buffers so deletions queued by a destructor land in the other
        // list and drain on the next tick.
        self.delete_current.set(1 - current);
        self.deferred_deleting.set(true);

        let items = std::mem::take(&mut *self.to_delete[current].borrow_mut());
        drop(items);

        self.deferred_deleting.set(false);
    }

    fn has_work(&self) -> bool {
        !self.files.borrow().is_empty()
            || self
                .timers
                .borrow()
                .iter()
                .any(|(_, e)| e.deadline.is_some())
            || !self.activations.borrow().is_empty()
            || !self.posts.queue.lock().is_empty()
    }
}

fn interest_for(events: u32) -> Interest {
    let want_read = events & (FileReadyType::READ | FileReadyType::CLOSED) != 0;
    let want_write = events & FileReadyType::WRITE != 0;
    match (want_read, want_write) {
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (false, true) => Interest::WRITABLE,
        // Registration requires at least one interest; CLOSED rides on READ.
        _ => Interest::READABLE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    /// Records drop order so tests can assert on destructor timing.
    struct DropTracker {
        id: u32,
        log: Rc<RefCell<Vec<u32>>>,
    }

    impl Drop for DropTracker {
        fn drop(&mut self) {
            self.log.borrow_mut().push(self.id);
        }
    }

    #[test]
    fn deferred_delete_runs_after_callback_returns() {
        let dispatcher = Rc::new(Dispatcher::new());
        let log: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));

        let d = dispatcher.clone();
        let log2 = log.clone();
        let timer = dispatcher.create_timer(move || {
            d.deferred_delete(Box::new(DropTracker {
                id: 1,
                log: log2.clone(),
            }));
            // The destructor must not have run inline.
            assert!(log2.borrow().is_empty());
            log2.borrow_mut().push(0);
        });
        timer.enable(Duration::ZERO);

        dispatcher.run(RunType::NonBlock);
        // The timer callback ran; the destructor is still pending on the
        // zero-delay drain timer.
        assert_eq!(*log.borrow(), vec![0]);

        dispatcher.run(RunType::NonBlock);
        // Callback marker first, destructor strictly after.
        assert_eq!(*log.borrow(), vec![0, 1]);
    }

    #[test]
    fn deferred_delete_during_drain_runs_next_tick() {
        let dispatcher = Rc::new(Dispatcher::new());
        let log: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));

        struct Requeue {
            dispatcher: Rc<Dispatcher>,
            log: Rc<RefCell<Vec<u32>>>,
        }
        impl Drop for Requeue {
            fn drop(&mut self) {
                self.log.borrow_mut().push(1);
                self.dispatcher.deferred_delete(Box::new(DropTracker {
                    id: 2,
                    log: self.log.clone(),
                }));
            }
        }

        dispatcher.deferred_delete(Box::new(Requeue {
            dispatcher: dispatcher.clone(),
            log: log.clone(),
        }));

        dispatcher.clear_deferred_delete_list();
        // The item queued by the destructor is still pending.
        assert_eq!(*log.borrow(), vec![1]);

        dispatcher.clear_deferred_delete_list();
        assert_eq!(*log.borrow(), vec![1, 2]);
    }

    #[test]
    fn post_is_fifo_from_one_thread() {
        let dispatcher = Dispatcher::new();
        let (tx, rx) = mpsc::channel();

        for i in 0..8 {
            let tx = tx.clone();
            dispatcher.post(move || tx.send(i).unwrap());
        }
        dispatcher.run(RunType::NonBlock);

        let order: Vec<i32> = rx.try_iter().collect();
        assert_eq!(order, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn cross_thread_post_wakes_blocked_loop() {
        let dispatcher = Dispatcher::new();
        let handle = dispatcher.handle();
        let (tx, rx) = mpsc::channel();

        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            let tx2 = tx.clone();
            handle.post(move || tx2.send(()).unwrap());
            handle.exit();
        });

        // Keep the loop alive; the post must interrupt the long timer wait.
        let timer = dispatcher.create_timer(|| {});
        timer.enable(Duration::from_secs(60));
        dispatcher.run(RunType::RunUntilExit);

        thread.join().unwrap();
        rx.try_recv().unwrap();
    }

    #[test]
    fn timer_rearm_supersedes_earlier_deadline() {
        let dispatcher = Dispatcher::new();
        let fired = Rc::new(Cell::new(0u32));

        let fired2 = fired.clone();
        let timer = dispatcher.create_timer(move || fired2.set(fired2.get() + 1));
        timer.enable(Duration::ZERO);
        timer.enable(Duration::from_secs(60));

        dispatcher.run(RunType::NonBlock);
        // The re-arm invalidated the zero-delay deadline.
        assert_eq!(fired.get(), 0);

        timer.enable(Duration::ZERO);
        dispatcher.run(RunType::NonBlock);
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn timer_disable_cancels() {
        let dispatcher = Dispatcher::new();
        let fired = Rc::new(Cell::new(false));

        let fired2 = fired.clone();
        let timer = dispatcher.create_timer(move || fired2.set(true));
        timer.enable(Duration::ZERO);
        assert!(timer.enabled());
        timer.disable();
        assert!(!timer.enabled());

        dispatcher.run(RunType::NonBlock);
        assert!(!fired.get());
    }

    #[test]
    fn file_event_delivers_read_readiness() {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;
        use std::os::unix::net::UnixStream;

        let dispatcher = Dispatcher::new();
        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();

        let got = Rc::new(Cell::new(0u32));
        let got2 = got.clone();
        let _event = dispatcher.create_file_event(
            b.as_raw_fd(),
            move |mask| got2.set(got2.get() | mask),
            TriggerType::Edge,
            FileReadyType::READ,
        );

        a.write_all(b"x").unwrap();
        dispatcher.run(RunType::NonBlock);
        // May need one more iteration for the edge to surface.
        if got.get() == 0 {
            dispatcher.run(RunType::NonBlock);
        }
        assert_ne!(got.get() & FileReadyType::READ, 0);
    }

    #[test]
    fn activate_synthesizes_readiness() {
        let dispatcher = Dispatcher::new();
        let (_a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();

        use std::os::unix::io::AsRawFd;
        let got = Rc::new(Cell::new(0u32));
        let got2 = got.clone();
        let event = dispatcher.create_file_event(
            b.as_raw_fd(),
            move |mask| got2.set(got2.get() | mask),
            TriggerType::Edge,
            FileReadyType::READ | FileReadyType::WRITE,
        );

        event.activate(FileReadyType::READ);
        dispatcher.run(RunType::NonBlock);
        assert_ne!(got.get() & FileReadyType::READ, 0);
    }
}
