use crate::client::{Client, ClientOptions};
use crate::errors::{Error, Result};
use log::{debug, warn};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

struct PoolInner {
    client_opts: ClientOptions,
    max_size: Option<usize>,
    client_timeout: Option<Duration>,
    idle: Mutex<VecDeque<Client>>,
    sem: Option<Semaphore>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl PoolInner {
    fn is_expired(&self, client: &Client) -> bool {
        let timeout = match self.client_timeout {
            Some(timeout) => timeout,
            None => return false,
        };
        if !client.is_connected() {
            return false;
        }
        match client.last_change_delta() {
            Some(delta) => delta >= timeout,
            None => false,
        }
    }
}

/// Bounded pool of [`Client`] objects with LIFO reuse, idle expiry and
/// an optional periodic autoclose sweep.
///
/// The permit semaphore is the only backpressure point: with a bounded
/// pool, `checked_out + idle` never exceeds `max_size`.
#[derive(Clone)]
pub struct ClientPool {
    inner: Arc<PoolInner>,
}

impl ClientPool {
    /// `max_size: None` means unbounded; `client_timeout: None` means
    /// idle clients never expire. With `autoclose` and a timeout set, a
    /// background task sweeps expired idle clients every tenth of the
    /// timeout.
    pub fn new(
        max_size: Option<usize>,
        client_timeout: Option<Duration>,
        autoclose: bool,
        client_opts: ClientOptions,
    ) -> ClientPool {
        let inner = Arc::new(PoolInner {
            client_opts,
            max_size,
            client_timeout,
            idle: Mutex::new(VecDeque::new()),
            sem: max_size.map(Semaphore::new),
            sweeper: Mutex::new(None),
        });
        if autoclose {
            if let Some(timeout) = client_timeout {
                let handle = spawn_sweeper(&inner, timeout);
                *inner.sweeper.lock().unwrap() = Some(handle);
            }
        }
        ClientPool { inner }
    }

    pub fn max_size(&self) -> Option<usize> {
        self.inner.max_size
    }

    /// Number of idle clients currently parked in the pool.
    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().unwrap().len()
    }

    /// Leases a client, suspending (fairly, FIFO) while the pool is at
    /// `max_size`. A fresh client whose connect failed is still leased:
    /// the caller observes the error on its first call.
    pub async fn get_connected_client(&self) -> Client {
        if let Some(sem) = &self.inner.sem {
            if let Ok(permit) = sem.acquire().await {
                permit.forget();
            }
        }
        if let Some(client) = self.pop_usable_idle() {
            return client;
        }
        let client = Client::new(self.inner.client_opts.clone());
        if let Err(err) = client.connect().await {
            warn!("pool client connect failed: {}", err);
        }
        client
    }

    /// Non-blocking lease: `None` when no permit is immediately
    /// available. A client built here is not connected yet; its first
    /// call connects it (autoconnect) or reports the failure.
    pub fn get_client_nowait(&self) -> Option<Client> {
        if let Some(sem) = &self.inner.sem {
            match sem.try_acquire() {
                Ok(permit) => permit.forget(),
                Err(_) => return None,
            }
        }
        Some(
            self.pop_usable_idle()
                .unwrap_or_else(|| Client::new(self.inner.client_opts.clone())),
        )
    }

    // most recent first; disconnected entries are dropped, expired ones
    // are disconnected and dropped
    fn pop_usable_idle(&self) -> Option<Client> {
        loop {
            let candidate = self.inner.idle.lock().unwrap().pop_back();
            match candidate {
                Some(client) => {
                    if !client.is_connected() {
                        debug!("discarding disconnected pooled client");
                        continue;
                    }
                    if self.inner.is_expired(&client) {
                        debug!("disconnecting expired pooled client");
                        client.disconnect();
                        continue;
                    }
                    return Some(client);
                }
                None => return None,
            }
        }
    }

    /// Returns a leased client to the pool. Expired clients are
    /// disconnected and dropped instead of being parked; the permit is
    /// released either way.
    pub fn release_client(&self, client: Client) {
        if self.inner.is_expired(&client) {
            debug!("released client has expired, disconnecting it");
            client.disconnect();
        } else {
            self.inner.idle.lock().unwrap().push_back(client);
        }
        if let Some(sem) = &self.inner.sem {
            sem.add_permits(1);
        }
    }

    /// Scoped lease: the returned guard derefs to the client and goes
    /// back to the pool exactly once when dropped, however the scope
    /// exits.
    pub async fn connected_client(&self) -> ClientLease {
        let client = self.get_connected_client().await;
        ClientLease {
            pool: self.clone(),
            client: Some(client),
        }
    }

    /// Warms the pool by acquiring and releasing `size` clients
    /// concurrently (`None` means `max_size`, which requires a bounded
    /// pool).
    pub async fn preconnect(&self, size: Option<usize>) -> Result<()> {
        let limit = match (size, self.inner.max_size) {
            (None, None) => {
                return Err(Error::client(
                    "preconnecting all clients requires a bounded pool",
                ))
            }
            (None, Some(max)) => max,
            (Some(n), None) => n,
            (Some(n), Some(max)) => n.min(max),
        };
        let mut handles = Vec::with_capacity(limit);
        for _ in 0..limit {
            let pool = self.clone();
            handles.push(tokio::spawn(
                async move { pool.get_connected_client().await },
            ));
        }
        for handle in handles {
            if let Ok(client) = handle.await {
                self.release_client(client);
            }
        }
        Ok(())
    }

    /// Disconnects and drops every idle client and stops the autoclose
    /// sweep. Leased clients are unaffected.
    pub fn destroy(&self) {
        let drained: Vec<Client> = {
            let mut idle = self.inner.idle.lock().unwrap();
            idle.drain(..).collect()
        };
        for client in drained {
            client.disconnect();
        }
        if let Some(handle) = self.inner.sweeper.lock().unwrap().take() {
            handle.abort();
        }
    }
}

fn spawn_sweeper(inner: &Arc<PoolInner>, timeout: Duration) -> JoinHandle<()> {
    // one sweep per tenth of the timeout
    let period = (timeout / 10).max(Duration::from_millis(10));
    let weak: Weak<PoolInner> = Arc::downgrade(inner);
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(period);
        loop {
            ticks.tick().await;
            let inner = match weak.upgrade() {
                Some(inner) => inner,
                None => break,
            };
            let expired: Vec<Client> = {
                let mut idle = inner.idle.lock().unwrap();
                let mut kept = VecDeque::with_capacity(idle.len());
                let mut expired = Vec::new();
                while let Some(client) = idle.pop_front() {
                    if inner.is_expired(&client) {
                        expired.push(client);
                    } else {
                        kept.push_back(client);
                    }
                }
                *idle = kept;
                expired
            };
            if !expired.is_empty() {
                debug!("autoclose: dropping {} expired client(s)", expired.len());
            }
            for client in expired {
                client.disconnect();
            }
        }
    })
}

/// RAII lease on a pooled client; yields the client through `Deref` and
/// returns it to the pool on drop.
pub struct ClientLease {
    pool: ClientPool,
    client: Option<Client>,
}

impl Deref for ClientLease {
    type Target = Client;

    fn deref(&self) -> &Client {
        self.client.as_ref().expect("client leased")
    }
}

impl DerefMut for ClientLease {
    fn deref_mut(&mut self) -> &mut Client {
        self.client.as_mut().expect("client leased")
    }
}

impl Drop for ClientLease {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.pool.release_client(client);
        }
    }
}
