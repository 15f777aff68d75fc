use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Shared connection-state cell. Every transition stamps the instant of
/// the change and broadcasts it; waiters observe the next transition
/// only, there is no replay of past states.
pub struct StateCell {
    tx: watch::Sender<ConnectionState>,
    since: Mutex<Instant>,
}

impl StateCell {
    pub fn new() -> StateCell {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        StateCell {
            tx,
            since: Mutex::new(Instant::now()),
        }
    }

    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.get() == ConnectionState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.get() == ConnectionState::Connecting
    }

    /// Moves to `new`, returning the replaced state. The timestamp is
    /// refreshed and every subscriber is woken, even when old == new.
    pub fn transition(&self, new: ConnectionState) -> ConnectionState {
        *self.since.lock().unwrap() = Instant::now();
        self.tx.send_replace(new)
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Waits for the very next transition and returns the state it
    /// landed on. Returns the current state if the cell is dropped
    /// while waiting.
    pub async fn wait_for_change(&self) -> ConnectionState {
        let mut rx = self.tx.subscribe();
        // mark whatever is current as seen: no replay
        let _ = rx.borrow_and_update();
        let _ = rx.changed().await;
        let current = *rx.borrow();
        current
    }

    /// Wall time elapsed since the last transition.
    pub fn last_change_delta(&self) -> Duration {
        self.since.lock().unwrap().elapsed()
    }
}

impl Default for StateCell {
    fn default() -> StateCell {
        StateCell::new()
    }
}
