use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use tracing::{debug, warn};

use super::{Task, TaskHandle, TaskState};
use crate::scheduler::EventLoop;

/// Upper bound on simultaneously running tasks; the rest wait in FIFO
/// order.
pub const MAX_ACTIVE_TASKS: usize = 32;

/// Bounded queue → running-set scheduler for tasks, bound to one event
/// loop. The manager owns its tasks while they are queued or running and
/// lets go the moment they end.
pub struct TaskManager {
    inner: Rc<RefCell<ManagerInner>>,
}

struct ManagerInner {
    queued: VecDeque<TaskHandle>,
    running: Vec<TaskHandle>,
    canceling: bool,
    event_loop: Rc<EventLoop>,
}

impl TaskManager {
    pub fn new(event_loop: Rc<EventLoop>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ManagerInner {
                queued: VecDeque::new(),
                running: Vec::new(),
                canceling: false,
                event_loop,
            })),
        }
    }

    pub fn add(&self, task: &TaskHandle) {
        self.add_internal(task, false);
    }

    /// Adds at the front of the queue, for tasks somebody is waiting on.
    pub fn add_prior(&self, task: &TaskHandle) {
        self.add_internal(task, true);
    }

    fn add_internal(&self, task: &TaskHandle, prior: bool) {
        if self.inner.borrow().canceling {
            warn!(task = task.borrow().id(), "Rejecting task, manager is canceling");
            return;
        }

        let task_id = task.borrow().id();
        let weak_inner = Rc::downgrade(&self.inner);
        task.borrow_mut().set_end_handler(Box::new(move || {
            if let Some(inner) = weak_inner.upgrade() {
                Self::remove_task(&inner, task_id);
            }
        }));

        let state = task.borrow().state();
        if state == TaskState::Running {
            // caller started it by hand, just track it
            self.inner.borrow_mut().running.push(task.clone());
            return;
        }
        if !task.borrow_mut().set_state(TaskState::Queued) {
            return;
        }
        {
            let mut inner = self.inner.borrow_mut();
            if prior {
                inner.queued.push_front(task.clone());
            } else {
                inner.queued.push_back(task.clone());
            }
        }
        debug!(task = task_id, prior, "Task queued");
        Self::schedule_dequeue(&self.inner);
    }

    fn remove_task(inner: &Rc<RefCell<ManagerInner>>, task_id: u64) {
        {
            let mut manager = inner.borrow_mut();
            manager.queued.retain(|task| task.borrow().id() != task_id);
            manager.running.retain(|task| task.borrow().id() != task_id);
        }
        Self::schedule_dequeue(inner);
    }

    fn schedule_dequeue(inner: &Rc<RefCell<ManagerInner>>) {
        let event_loop = inner.borrow().event_loop.clone();
        let weak = Rc::downgrade(inner);
        event_loop.post(move || {
            if let Some(inner) = weak.upgrade() {
                Self::dequeue(&inner);
            }
        });
    }

    fn dequeue(inner: &Rc<RefCell<ManagerInner>>) {
        loop {
            let task = {
                let mut manager = inner.borrow_mut();
                if manager.canceling || manager.running.len() >= MAX_ACTIVE_TASKS {
                    return;
                }
                match manager.queued.pop_front() {
                    Some(task) => task,
                    None => return,
                }
            };
            // ended while waiting, e.g. canceled by its owner
            if task.borrow().is_end() {
                continue;
            }
            let event_loop = {
                let mut manager = inner.borrow_mut();
                manager.running.push(task.clone());
                manager.event_loop.clone()
            };
            event_loop.post(move || Task::start(&task));
        }
    }

    /// Cancels every tracked task. New tasks are rejected for the
    /// duration; end handlers are detached first so the cancellations do
    /// not re-enter the collections being cleared.
    pub fn cancel_all(&self) {
        let tasks: Vec<TaskHandle> = {
            let mut manager = self.inner.borrow_mut();
            manager.canceling = true;
            let mut tasks: Vec<TaskHandle> = manager.queued.drain(..).collect();
            tasks.append(&mut manager.running);
            tasks
        };
        for task in &tasks {
            task.borrow_mut().clear_end_handler();
            Task::cancel(task);
        }
        self.inner.borrow_mut().canceling = false;
    }

    pub fn queued_count(&self) -> usize {
        self.inner.borrow().queued.len()
    }

    pub fn running_count(&self) -> usize {
        self.inner.borrow().running.len()
    }
}
