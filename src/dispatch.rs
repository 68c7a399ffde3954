// Cooperative task dispatcher
//
// A Dispatcher owns a queue of boxed tasks ordered by their ready
// timepoint. Worker threads loop dispatch()/wait() until asked to stop.
// The main-thread dispatcher is a separate object that is only drained
// by whoever owns the main thread, so UI-bound continuations have a
// stable home. A process-wide registry maps thread ids to dispatchers
// so a completed task can hand its continuation back to the thread that
// asked for it; continuations aimed at the currently-dispatching thread
// land on a deferred list instead of re-entering the active queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use lazy_static::lazy_static;

type TaskFn = Box<dyn FnOnce() + Send>;

struct ScheduledTask {
    task: TaskFn,
    timepoint: Instant,
}

struct Registry {
    dispatchers: Mutex<HashMap<thread::ThreadId, Weak<Dispatcher>>>,
    main: Mutex<(Option<thread::ThreadId>, Weak<Dispatcher>)>,
    deferred: Mutex<HashMap<thread::ThreadId, Vec<TaskFn>>>,
}

lazy_static! {
    static ref REGISTRY: Registry = Registry {
        dispatchers: Mutex::new(HashMap::new()),
        main: Mutex::new((None, Weak::new())),
        deferred: Mutex::new(HashMap::new()),
    };
}

fn set_thread_dispatcher(dispatcher: Option<Arc<Dispatcher>>) {
    let id = thread::current().id();
    match dispatcher {
        Some(d) => {
            REGISTRY.dispatchers.lock().unwrap().insert(id, Arc::downgrade(&d));
        }
        None => {
            REGISTRY.dispatchers.lock().unwrap().remove(&id);
            REGISTRY.deferred.lock().unwrap().remove(&id);
        }
    }
}

/// Queue a closure onto the calling thread's deferred list. It runs at
/// the end of that thread's current (or next) dispatch() pass.
pub fn thread_local_deferred(task: TaskFn) {
    let id = thread::current().id();
    REGISTRY
        .deferred
        .lock()
        .unwrap()
        .entry(id)
        .or_insert_with(Vec::new)
        .push(task);
}

pub struct Dispatcher {
    queue: Mutex<Vec<ScheduledTask>>,
    cond: Condvar,
}

impl Dispatcher {
    fn new() -> Arc<Dispatcher> {
        Arc::new(Dispatcher {
            queue: Mutex::new(Vec::new()),
            cond: Condvar::new(),
        })
    }

    /// Run one ready task, then drain this thread's deferred list.
    /// Returns the number of tasks fetched from the queue (0 or 1).
    pub fn dispatch(&self) -> u32 {
        let mut fetch = 0;
        let task = {
            let mut queue = self.queue.lock().unwrap();
            if !queue.is_empty() && queue[0].timepoint <= Instant::now() {
                fetch += 1;
                Some(queue.remove(0))
            } else {
                None
            }
        };
        if let Some(task) = task {
            (task.task)();
        }

        let deferred = {
            let id = thread::current().id();
            let mut map = REGISTRY.deferred.lock().unwrap();
            match map.get_mut(&id) {
                Some(list) => std::mem::replace(list, Vec::new()),
                None => Vec::new(),
            }
        };
        for fun in deferred {
            fun();
        }
        fetch
    }

    pub fn enqueue(&self, task: TaskFn) {
        self.enqueue_at(task, Instant::now());
    }

    pub fn schedule(&self, task: TaskFn, delay: Duration) {
        self.enqueue_at(task, Instant::now() + delay);
    }

    fn enqueue_at(&self, task: TaskFn, timepoint: Instant) {
        let mut queue = self.queue.lock().unwrap();
        let pos = queue.partition_point(|t| t.timepoint < timepoint);
        queue.insert(pos, ScheduledTask { task, timepoint });
        self.cond.notify_all();
    }

    /// Block until a task could be ready or the dispatcher is notified.
    pub fn wait(&self) {
        let queue = self.queue.lock().unwrap();
        if let Some(front) = queue.first() {
            let now = Instant::now();
            if front.timepoint > now {
                let wait_duration = front.timepoint - now;
                let _ = self
                    .cond
                    .wait_timeout(queue, wait_duration)
                    .unwrap();
            }
        } else {
            let _guard = self.cond.wait(queue).unwrap();
        }
    }

    /// Timed wait that distinguishes its two outcomes: true means a
    /// task was ready (or became due) before the deadline, false means
    /// the timeout elapsed against an empty or not-yet-due queue.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let queue = self.queue.lock().unwrap();
        if let Some(front) = queue.first() {
            if front.timepoint < deadline {
                let now = Instant::now();
                if front.timepoint > now {
                    let wait_duration = front.timepoint - now;
                    let _ = self
                        .cond
                        .wait_timeout(queue, wait_duration)
                        .unwrap();
                }
                return true;
            }
        }
        let now = Instant::now();
        if deadline <= now {
            return false;
        }
        let (_guard, result) = self.cond.wait_timeout(queue, deadline - now).unwrap();
        !result.timed_out()
    }

    pub fn notify(&self) {
        // take the queue lock so a worker between its stop check and
        // its wait cannot miss the wakeup
        let _queue = self.queue.lock().unwrap();
        self.cond.notify_all();
    }

    // Worker-loop wait: re-checks the stop flag under the queue lock so
    // shutdown cannot slip between the check and the wait.
    fn wait_or_stop(&self, stop: &AtomicBool) {
        let queue = self.queue.lock().unwrap();
        if stop.load(Ordering::Acquire) {
            return;
        }
        if let Some(front) = queue.first() {
            let now = Instant::now();
            if front.timepoint > now {
                let wait_duration = front.timepoint - now;
                let _ = self
                    .cond
                    .wait_timeout(queue, wait_duration)
                    .unwrap();
            }
        } else {
            let _guard = self.cond.wait(queue).unwrap();
        }
    }

    pub fn is_main(self: &Arc<Self>) -> bool {
        let main = REGISTRY.main.lock().unwrap();
        main.1
            .upgrade()
            .map_or(false, |d| Arc::ptr_eq(&d, self))
    }

    pub fn pending_tasks(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

/// Dispatcher for the calling thread, if one is registered.
pub fn thread_dispatcher(id: thread::ThreadId) -> Option<Arc<Dispatcher>> {
    {
        let main = REGISTRY.main.lock().unwrap();
        if main.0 == Some(id) {
            return main.1.upgrade();
        }
    }
    REGISTRY
        .dispatchers
        .lock()
        .unwrap()
        .get(&id)
        .and_then(|w| w.upgrade())
}

/// Claim the calling thread as the process main thread. The main
/// dispatch queue anchors to it.
pub fn set_dispatch_main_thread() {
    let mut main = REGISTRY.main.lock().unwrap();
    main.0 = Some(thread::current().id());
}

/// Shared handle to a task's eventual result.
pub struct TaskHandle<T> {
    state: Arc<TaskState<T>>,
}

struct TaskState<T> {
    result: Mutex<Option<T>>,
    cond: Condvar,
    continuations: Mutex<Vec<(Arc<Dispatcher>, TaskFn)>>,
}

impl<T: Send + 'static> TaskHandle<T> {
    fn new() -> (TaskHandle<T>, Arc<TaskState<T>>) {
        let state = Arc::new(TaskState {
            result: Mutex::new(None),
            cond: Condvar::new(),
            continuations: Mutex::new(Vec::new()),
        });
        (
            TaskHandle {
                state: state.clone(),
            },
            state,
        )
    }

    /// Block the calling thread until the task finishes.
    pub fn wait(self) -> T {
        let mut result = self.state.result.lock().unwrap();
        while result.is_none() {
            result = self.state.cond.wait(result).unwrap();
        }
        result.take().unwrap()
    }

    pub fn is_complete(&self) -> bool {
        self.state.result.lock().unwrap().is_some()
    }

    /// Run a continuation on the given queue once the task completes.
    /// If it already completed, the continuation is enqueued right away.
    pub fn then<F>(&self, queue: &DispatchQueue, fun: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let target = queue.dispatcher.clone();
        let mut continuations = self.state.continuations.lock().unwrap();
        if self.state.result.lock().unwrap().is_some() {
            drop(continuations);
            resume_on(target, Box::new(fun));
        } else {
            continuations.push((target, Box::new(fun)));
        }
    }
}

impl<T> TaskState<T> {
    fn complete(&self, value: T) {
        *self.result.lock().unwrap() = Some(value);
        self.cond.notify_all();
        let continuations = std::mem::replace(
            &mut *self.continuations.lock().unwrap(),
            Vec::new(),
        );
        for (target, fun) in continuations {
            resume_on(target, fun);
        }
    }
}

// Hand a continuation to its target dispatcher. If the target is the
// dispatcher of the current thread (and not the main queue), it goes on
// the thread's deferred list so an active dispatch() frame is not
// re-entered.
fn resume_on(target: Arc<Dispatcher>, fun: TaskFn) {
    let current = thread_dispatcher(thread::current().id());
    if let Some(current) = current {
        if Arc::ptr_eq(&current, &target) && !target.is_main() {
            thread_local_deferred(fun);
            return;
        }
    }
    target.enqueue(fun);
}

/// A dispatcher bound to a set of worker threads (or, for the main
/// queue, to whichever thread drains it).
pub struct DispatchQueue {
    dispatcher: Arc<Dispatcher>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    stop: Arc<AtomicBool>,
    num_threads: u32,
}

impl DispatchQueue {
    /// Queue with `max_threads` worker threads (at least one).
    pub fn new(max_threads: u32) -> DispatchQueue {
        let num_threads = max_threads.max(1);
        let dispatcher = Dispatcher::new();
        let stop = Arc::new(AtomicBool::new(false));

        let mut threads = Vec::with_capacity(num_threads as usize);
        for _ in 0..num_threads {
            let dispatcher = dispatcher.clone();
            let stop = stop.clone();
            threads.push(thread::spawn(move || {
                set_thread_dispatcher(Some(dispatcher.clone()));
                while !stop.load(Ordering::Acquire) {
                    if dispatcher.dispatch() == 0 {
                        dispatcher.wait_or_stop(&stop);
                    }
                }
                set_thread_dispatcher(None);
            }));
        }

        DispatchQueue {
            dispatcher,
            threads: Mutex::new(threads),
            stop,
            num_threads,
        }
    }

    fn new_main() -> DispatchQueue {
        DispatchQueue {
            dispatcher: Dispatcher::new(),
            threads: Mutex::new(Vec::new()),
            stop: Arc::new(AtomicBool::new(false)),
            num_threads: 1,
        }
    }

    /// The main-thread queue. Nothing runs from it unless the owner of
    /// the main thread calls `dispatch()`.
    pub fn main() -> &'static DispatchQueue {
        lazy_static! {
            static ref MAIN: DispatchQueue = {
                let queue = DispatchQueue::new_main();
                REGISTRY.main.lock().unwrap().1 = Arc::downgrade(&queue.dispatcher);
                queue
            };
        }
        &MAIN
    }

    /// The shared worker pool.
    pub fn global() -> &'static DispatchQueue {
        lazy_static! {
            static ref GLOBAL: DispatchQueue = {
                let n = thread::available_parallelism()
                    .map(|n| n.get() as u32)
                    .unwrap_or(1)
                    .max(3)
                    - 1;
                DispatchQueue::new(n)
            };
        }
        &GLOBAL
    }

    pub fn is_main_thread() -> bool {
        REGISTRY.main.lock().unwrap().0 == Some(thread::current().id())
    }

    pub fn num_threads(&self) -> u32 {
        self.num_threads
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Drain one task from this queue on the calling thread.
    pub fn dispatch(&self) -> u32 {
        self.dispatcher.dispatch()
    }

    /// Run a closure on this queue, returning a handle to its result.
    pub fn async_task<T, F>(&self, fun: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (handle, state) = TaskHandle::new();
        self.dispatcher.enqueue(Box::new(move || {
            let value = fun();
            state.complete(value);
        }));
        handle
    }

    /// Run a closure on this queue after a delay.
    pub fn schedule<T, F>(&self, delay: Duration, fun: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (handle, state) = TaskHandle::new();
        self.dispatcher.schedule(
            Box::new(move || {
                let value = fun();
                state.complete(value);
            }),
            delay,
        );
        handle
    }

    /// Detached fire-and-forget task.
    pub fn dispatch_async<F>(&self, fun: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.dispatcher.enqueue(Box::new(fun));
    }

    /// Stop the workers: request cooperative shutdown, wake everyone,
    /// and join.
    pub fn shutdown(&self) {
        let mut threads = self.threads.lock().unwrap();
        if threads.is_empty() {
            return;
        }
        self.stop.store(true, Ordering::Release);
        self.dispatcher.notify();
        for t in threads.drain(..) {
            let _ = t.join();
        }
    }
}

impl Drop for DispatchQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn dispatch_runs_ready_tasks_in_order() {
        let dispatcher = Dispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            dispatcher.enqueue(Box::new(move || order.lock().unwrap().push(i)));
        }
        while dispatcher.dispatch() > 0 {}
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn delayed_tasks_are_not_ready_early() {
        let dispatcher = Dispatcher::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        dispatcher.schedule(
            Box::new(move || flag.store(true, Ordering::SeqCst)),
            Duration::from_millis(200),
        );
        assert_eq!(dispatcher.dispatch(), 0);
        assert!(!ran.load(Ordering::SeqCst));

        thread::sleep(Duration::from_millis(250));
        assert_eq!(dispatcher.dispatch(), 1);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn wait_timeout_distinguishes_ready_from_empty() {
        let dispatcher = Dispatcher::new();

        // empty queue: the timeout elapses
        assert!(!dispatcher.wait_timeout(Duration::from_millis(20)));

        // a task due before the deadline: reported as ready even though
        // we slept for it
        dispatcher.schedule(Box::new(|| {}), Duration::from_millis(10));
        assert!(dispatcher.wait_timeout(Duration::from_millis(500)));

        // a task due after the deadline behaves like an empty queue
        let dispatcher = Dispatcher::new();
        dispatcher.schedule(Box::new(|| {}), Duration::from_secs(60));
        assert!(!dispatcher.wait_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn worker_pool_executes_tasks() {
        let queue = DispatchQueue::new(2);
        let counter = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let counter = counter.clone();
            handles.push(queue.async_task(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.wait();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 16);
        queue.shutdown();
    }

    #[test]
    fn task_handle_returns_the_result() {
        let queue = DispatchQueue::new(1);
        let handle = queue.async_task(|| 6 * 7);
        assert_eq!(handle.wait(), 42);
        queue.shutdown();
    }

    #[test]
    fn continuations_run_on_the_target_queue() {
        let queue = DispatchQueue::new(1);
        let other = DispatchQueue::new(1);

        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        let handle = queue.async_task(|| 5);
        handle.then(&other, move || {
            flag.store(true, Ordering::SeqCst);
        });
        assert_eq!(handle.wait(), 5);

        // give the continuation a moment to run on `other`
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done.load(Ordering::SeqCst) {
            assert!(Instant::now() < deadline, "continuation never ran");
            thread::sleep(Duration::from_millis(5));
        }
        queue.shutdown();
        other.shutdown();
    }

    #[test]
    fn scheduled_task_waits_for_its_delay() {
        let queue = DispatchQueue::new(1);
        let started = Instant::now();
        let handle = queue.schedule(Duration::from_millis(100), move || Instant::now());
        let finished = handle.wait();
        assert!(finished.duration_since(started) >= Duration::from_millis(100));
        queue.shutdown();
    }
}
