//! Inbox feeding one agent thread.
//!
//! The plant thread (perception samples, zone entry and exit) and the radio
//! thread (deliveries, negotiation ticks) both push here; the agent thread is
//! the only consumer, so every state change happens in one arrival order.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

pub struct Inbox<T> {
    state: Mutex<InboxState<T>>,
    arrived: Condvar,
}

struct InboxState<T> {
    pending: VecDeque<T>,
    closed: bool,
    /// Largest backlog seen; a growing value means the agent falls behind.
    peak_depth: usize,
}

impl<T> Inbox<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(InboxState {
                pending: VecDeque::new(),
                closed: false,
                peak_depth: 0,
            }),
            arrived: Condvar::new(),
        }
    }

    /// Append an event. A closed inbox hands it back so the producer can stop.
    pub fn push(&self, event: T) -> Result<(), T> {
        let mut guard = self.state.lock().expect("agent inbox mutex poisoned");
        if guard.closed {
            return Err(event);
        }
        guard.pending.push_back(event);
        guard.peak_depth = guard.peak_depth.max(guard.pending.len());
        self.arrived.notify_one();
        Ok(())
    }

    /// Next event in arrival order, waiting if none is queued. `None` once
    /// the inbox is closed and everything queued before the close is consumed.
    pub fn recv(&self) -> Option<T> {
        let mut guard = self.state.lock().expect("agent inbox mutex poisoned");
        loop {
            if let Some(event) = guard.pending.pop_front() {
                return Some(event);
            }
            if guard.closed {
                return None;
            }
            guard = self.arrived.wait(guard).expect("agent inbox wait failed");
        }
    }

    pub fn close(&self) {
        let mut guard = self.state.lock().expect("agent inbox mutex poisoned");
        guard.closed = true;
        self.arrived.notify_all();
    }

    pub fn peak_depth(&self) -> usize {
        self.state.lock().expect("agent inbox mutex poisoned").peak_depth
    }
}

impl<T> Default for Inbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    fn drain<T>(inbox: &Inbox<T>) -> Vec<T> {
        inbox.close();
        std::iter::from_fn(|| inbox.recv()).collect()
    }

    #[test]
    fn plant_and_radio_events_keep_their_own_order() {
        let inbox = Arc::new(Inbox::new());
        let producers = 2;
        let per_producer = 100u64;
        let barrier = Arc::new(Barrier::new(producers));

        let mut handles = Vec::new();
        for producer in 0..producers {
            let inbox = Arc::clone(&inbox);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                barrier.wait();
                for seq in 0..per_producer {
                    inbox.push((producer, seq)).expect("inbox closed");
                }
            }));
        }
        for handle in handles {
            handle.join().expect("producer thread panicked");
        }

        let events = drain(&inbox);
        assert_eq!(events.len() as u64, producers as u64 * per_producer);
        for producer in 0..producers {
            let seqs: Vec<u64> = events
                .iter()
                .filter(|(from, _)| *from == producer)
                .map(|(_, seq)| *seq)
                .collect();
            assert!(seqs.windows(2).all(|pair| pair[0] < pair[1]));
        }
        assert_eq!(inbox.peak_depth(), events.len());
    }

    #[test]
    fn waiting_agent_wakes_on_delivery() {
        let inbox = Arc::new(Inbox::new());
        let (ready_tx, ready_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();

        let agent = Arc::clone(&inbox);
        let handle = thread::spawn(move || {
            ready_tx.send(()).expect("send ready");
            done_tx.send(agent.recv()).expect("send event");
        });

        ready_rx.recv_timeout(Duration::from_secs(1)).expect("ready");
        inbox.push("tick").expect("inbox closed");
        let received = done_rx.recv_timeout(Duration::from_secs(1)).expect("event");
        assert_eq!(received, Some("tick"));
        handle.join().expect("agent thread panicked");
    }

    #[test]
    fn close_delivers_backlog_then_refuses_pushes() {
        let inbox = Inbox::new();
        inbox.push("perception").expect("inbox closed");
        inbox.push("tick").expect("inbox closed");
        inbox.close();
        assert_eq!(inbox.recv(), Some("perception"));
        assert_eq!(inbox.recv(), Some("tick"));
        assert_eq!(inbox.recv(), None);
        assert_eq!(inbox.push("late"), Err("late"));
        assert_eq!(inbox.peak_depth(), 2);
    }

    #[test]
    fn close_releases_a_waiting_agent() {
        let inbox: Arc<Inbox<u8>> = Arc::new(Inbox::new());
        let (ready_tx, ready_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();

        let agent = Arc::clone(&inbox);
        let handle = thread::spawn(move || {
            ready_tx.send(()).expect("ready");
            done_tx.send(agent.recv().is_none()).expect("done");
        });

        ready_rx.recv_timeout(Duration::from_secs(1)).expect("ready");
        inbox.close();
        assert!(done_rx.recv_timeout(Duration::from_secs(1)).expect("done recv"));
        handle.join().expect("agent thread panicked");
    }
}
