//! The scheduler's internal service thread.
//!
//! A single dedicated thread runs small control closures for the rest of the
//! scheduler: delayed-task timer callbacks, periodic capacity adjustment, and
//! heartbeat probes. Work arrives over a channel; delayed work waits in a
//! local timer heap and the loop sleeps until the earliest deadline.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

type ServiceClosure = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    Run(ServiceClosure),
    RunAt(Instant, ServiceClosure),
    Stop,
}

struct TimerEntry {
    deadline: Instant,
    // Insertion order breaks deadline ties first-posted-first.
    order: u64,
    closure: ServiceClosure,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.order == other.order
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.order.cmp(&other.order))
    }
}

/// Posting handle onto the service thread. Cheap to clone.
#[derive(Clone)]
pub struct ServiceThreadRunner {
    sender: Sender<Command>,
}

impl ServiceThreadRunner {
    /// Runs `closure` on the service thread as soon as possible. Returns
    /// false once the service thread has stopped.
    pub fn post_task(&self, closure: ServiceClosure) -> bool {
        self.sender.send(Command::Run(closure)).is_ok()
    }

    /// Runs `closure` on the service thread once `delay` has elapsed.
    pub fn post_delayed_task(&self, delay: Duration, closure: ServiceClosure) -> bool {
        self.sender
            .send(Command::RunAt(Instant::now() + delay, closure))
            .is_ok()
    }
}

/// The service thread itself.
pub struct ServiceThread {
    sender: Sender<Command>,
    join_handle: Option<JoinHandle<()>>,
}

impl ServiceThread {
    /// Spawns the service thread.
    pub fn start(label: &str) -> std::io::Result<Self> {
        let (sender, receiver) = channel::unbounded();
        let join_handle = std::thread::Builder::new()
            .name(format!("{label}ServiceThread"))
            .spawn(move || Self::run(receiver))?;
        Ok(Self {
            sender,
            join_handle: Some(join_handle),
        })
    }

    /// A posting handle for internal components.
    pub fn task_runner(&self) -> ServiceThreadRunner {
        ServiceThreadRunner {
            sender: self.sender.clone(),
        }
    }

    /// Stops the thread after the commands already queued have been drained.
    /// Pending timers that have not fired are dropped.
    pub fn stop(&mut self) {
        if let Some(handle) = self.join_handle.take() {
            let _ = self.sender.send(Command::Stop);
            let _ = handle.join();
        }
    }

    fn run(receiver: Receiver<Command>) {
        let mut timers: BinaryHeap<Reverse<TimerEntry>> = BinaryHeap::new();
        let mut next_order: u64 = 0;
        loop {
            // Fire everything ripe before sleeping again.
            let now = Instant::now();
            while timers
                .peek()
                .is_some_and(|Reverse(entry)| entry.deadline <= now)
            {
                let Reverse(entry) = timers.pop().unwrap();
                (entry.closure)();
            }

            let command = match timers.peek() {
                Some(Reverse(entry)) => {
                    let timeout = entry.deadline.saturating_duration_since(Instant::now());
                    match receiver.recv_timeout(timeout) {
                        Ok(command) => command,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match receiver.recv() {
                    Ok(command) => command,
                    Err(_) => break,
                },
            };

            match command {
                Command::Run(closure) => closure(),
                Command::RunAt(deadline, closure) => {
                    timers.push(Reverse(TimerEntry {
                        deadline,
                        order: next_order,
                        closure,
                    }));
                    next_order += 1;
                }
                Command::Stop => break,
            }
        }
    }
}

impl Drop for ServiceThread {
    fn drop(&mut self) {
        self.stop();
    }
}
