use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// The cooperative event loop everything in the engine runs on. All task,
/// call and manager mutations happen from closures posted here, one at a
/// time; collaborators running elsewhere must post their notifications
/// instead of delivering them inline.
#[derive(Default)]
pub struct EventLoop {
    queue: RefCell<VecDeque<Box<dyn FnOnce()>>>,
}

impl EventLoop {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Schedules `f` for the next tick. Never runs it inline.
    pub fn post(&self, f: impl FnOnce() + 'static) {
        self.queue.borrow_mut().push_back(Box::new(f));
    }

    pub fn pending(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Runs posted closures, including ones they post in turn, until the
    /// queue drains.
    pub fn run_until_idle(&self) {
        loop {
            let next = self.queue.borrow_mut().pop_front();
            match next {
                Some(f) => f(),
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_in_post_order() {
        let event_loop = EventLoop::new();
        let seen = Rc::new(RefCell::new(Vec::new()));

        for i in 0..3 {
            let seen = seen.clone();
            event_loop.post(move || seen.borrow_mut().push(i));
        }
        assert_eq!(event_loop.pending(), 3);
        event_loop.run_until_idle();
        assert_eq!(*seen.borrow(), vec![0, 1, 2]);
        assert_eq!(event_loop.pending(), 0);
    }

    #[test]
    fn nested_posts_run_in_the_same_drain() {
        let event_loop = EventLoop::new();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let inner_loop = event_loop.clone();
        let inner_seen = seen.clone();
        event_loop.post(move || {
            inner_seen.borrow_mut().push("outer");
            let seen = inner_seen.clone();
            inner_loop.post(move || seen.borrow_mut().push("inner"));
        });
        event_loop.run_until_idle();
        assert_eq!(*seen.borrow(), vec!["outer", "inner"]);
    }
}
