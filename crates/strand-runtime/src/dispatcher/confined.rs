//! Confined single-queue dispatcher

use std::sync::Arc;

use strand_core::ktrace;

use super::{Dispatcher, Runnable};

/// A host-owned serial queue (a UI main queue, an event loop)
pub trait HostQueue: Send + Sync {
    /// Enqueue a callback; callbacks run in FIFO order on the queue's thread
    fn post(&self, callback: Box<dyn FnOnce() + Send>);

    /// Whether the calling thread is the one draining this queue
    fn is_on_queue(&self) -> bool {
        false
    }
}

/// Serializes every resumption onto one host queue
#[derive(Clone)]
pub struct ConfinedDispatcher {
    queue: Arc<dyn HostQueue>,
    immediate: bool,
    name: String,
}

impl ConfinedDispatcher {
    pub fn new(queue: Arc<dyn HostQueue>, name: impl Into<String>) -> Self {
        Self {
            queue,
            immediate: false,
            name: name.into(),
        }
    }

    /// Variant that runs inline when already on the queue's thread
    pub fn immediate(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            immediate: true,
            name: format!("{}.immediate", self.name),
        }
    }

    pub fn is_immediate(&self) -> bool {
        self.immediate
    }

    pub fn queue(&self) -> &Arc<dyn HostQueue> {
        &self.queue
    }
}

impl Dispatcher for ConfinedDispatcher {
    fn dispatch(&self, runnable: Runnable) {
        ktrace!("dispatch to {}", self.name);
        self.queue.post(Box::new(move || runnable.run()));
    }

    fn is_dispatch_needed(&self) -> bool {
        !(self.immediate && self.queue.is_on_queue())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{resume_on, EventLoop};
    use std::sync::Mutex;

    #[test]
    fn test_confined_preserves_fifo() {
        let event_loop = Arc::new(EventLoop::new());
        let d = ConfinedDispatcher::new(event_loop.clone(), "main");
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let log = Arc::clone(&log);
            d.dispatch(Runnable::new(move || log.lock().unwrap().push(i)));
        }
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(event_loop.run_until_idle(), 5);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_immediate_skips_hand_off_on_queue() {
        let event_loop = Arc::new(EventLoop::new());
        let d = ConfinedDispatcher::new(event_loop.clone(), "main");
        let imm = d.immediate();
        // The loop was created on this thread, so we are "on the queue"
        assert!(d.is_dispatch_needed());
        assert!(!imm.is_dispatch_needed());

        let log = Arc::new(Mutex::new(Vec::new()));
        let l = Arc::clone(&log);
        resume_on(&imm, Runnable::new(move || l.lock().unwrap().push("inline")));
        assert_eq!(*log.lock().unwrap(), vec!["inline"]);
        assert_eq!(event_loop.len(), 0);

        // From another thread the immediate variant still posts
        let imm2 = imm.clone();
        let l = Arc::clone(&log);
        std::thread::spawn(move || {
            assert!(imm2.is_dispatch_needed());
            resume_on(&imm2, Runnable::new(move || l.lock().unwrap().push("posted")));
        })
        .join()
        .unwrap();
        assert_eq!(event_loop.len(), 1);
        event_loop.run_until_idle();
        assert_eq!(*log.lock().unwrap(), vec!["inline", "posted"]);
    }
}
