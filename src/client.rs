use crate::codec::{format_command, Argument, Reply, ReplyReader};
use crate::connection::{Connection, ConnectionEvent, ConnectionOptions};
use crate::errors::{Error, Result};
use crate::pipeline::Pipeline;
use log::{debug, warn};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{span, Level};

/// Client construction options; also the per-client template used by
/// the pool.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub host: String,
    pub port: u16,
    /// Unix domain socket path; overrides host/port when set.
    pub unix_socket: Option<PathBuf>,
    /// Connect transparently on the first call instead of failing.
    pub autoconnect: bool,
    pub password: Option<String>,
    /// Database index selected right after authentication.
    pub db: Option<i64>,
    pub connect_timeout: Duration,
    pub read_page_size: usize,
    pub write_page_size: usize,
    pub tcp_nodelay: bool,
    pub aggressive_write: bool,
}

impl Default for ClientOptions {
    fn default() -> ClientOptions {
        let conn = ConnectionOptions::default();
        ClientOptions {
            host: conn.host,
            port: conn.port,
            unix_socket: None,
            autoconnect: true,
            password: None,
            db: None,
            connect_timeout: conn.connect_timeout,
            read_page_size: conn.read_page_size,
            write_page_size: conn.write_page_size,
            tcp_nodelay: false,
            aggressive_write: false,
        }
    }
}

impl ClientOptions {
    fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            host: self.host.clone(),
            port: self.port,
            unix_socket: self.unix_socket.clone(),
            connect_timeout: self.connect_timeout,
            read_page_size: self.read_page_size,
            write_page_size: self.write_page_size,
            tcp_nodelay: self.tcp_nodelay,
            aggressive_write: self.aggressive_write,
        }
    }
}

/// Fire-and-forget reply consumer for `async_call`.
pub type ReplyCallback = Box<dyn FnOnce(Result<Reply>) + Send + 'static>;

// One entry per expected reply, drained strictly in FIFO order.
enum PendingEntry {
    Single(oneshot::Sender<Result<Reply>>),
    Callback(ReplyCallback),
    Discard,
    // k consecutive entries share one accumulator and one output future
    Aggregating(Arc<Mutex<Aggregate>>),
}

struct Aggregate {
    remaining: usize,
    replies: Vec<Reply>,
    tx: Option<oneshot::Sender<Result<Vec<Reply>>>>,
}

impl PendingEntry {
    fn fail(self, err: Error) {
        match self {
            PendingEntry::Single(tx) => {
                let _ = tx.send(Err(err));
            }
            PendingEntry::Callback(cb) => cb(Err(err)),
            PendingEntry::Discard => {}
            PendingEntry::Aggregating(agg) => {
                // only the first of the k entries carries the failure out
                if let Some(tx) = agg.lock().unwrap().tx.take() {
                    let _ = tx.send(Err(err));
                }
            }
        }
    }
}

// Undispatched replies for a subscribed client, closed by an explicit
// sentinel instead of a magic value.
pub(crate) enum PubSubItem {
    Message(Reply),
    ConnectionClosed,
}

struct Shared {
    pending: Mutex<VecDeque<PendingEntry>>,
    reply_list: Mutex<VecDeque<PubSubItem>>,
    reply_notify: Notify,
    subscribed: AtomicBool,
}

impl Shared {
    fn new() -> Shared {
        Shared {
            pending: Mutex::new(VecDeque::new()),
            reply_list: Mutex::new(VecDeque::new()),
            reply_notify: Notify::new(),
            subscribed: AtomicBool::new(false),
        }
    }

    fn dispatch_reply(&self, reply: Reply) {
        let entry = self.pending.lock().unwrap().pop_front();
        match entry {
            Some(PendingEntry::Single(tx)) => {
                let _ = tx.send(Ok(reply));
            }
            Some(PendingEntry::Callback(cb)) => cb(Ok(reply)),
            Some(PendingEntry::Discard) => {}
            Some(PendingEntry::Aggregating(agg)) => {
                let mut agg = agg.lock().unwrap();
                agg.replies.push(reply);
                agg.remaining -= 1;
                if agg.remaining == 0 {
                    let replies = std::mem::take(&mut agg.replies);
                    if let Some(tx) = agg.tx.take() {
                        let _ = tx.send(Ok(replies));
                    }
                }
            }
            None => {
                self.reply_list
                    .lock()
                    .unwrap()
                    .push_back(PubSubItem::Message(reply));
                self.reply_notify.notify_one();
            }
        }
    }

    // connection went down: every in-flight request fails, in order
    fn fail_all_pending(&self) {
        let entries: Vec<PendingEntry> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain(..).collect()
        };
        for entry in entries {
            entry.fail(Error::connection("connection to redis closed"));
        }
        if self.subscribed.load(Ordering::SeqCst) {
            self.reply_list
                .lock()
                .unwrap()
                .push_back(PubSubItem::ConnectionClosed);
            self.reply_notify.notify_one();
        }
    }
}

async fn dispatch_loop(
    shared: Arc<Shared>,
    conn: Arc<Connection>,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    let mut reader = ReplyReader::new();
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Data(data) => {
                let span = span!(Level::DEBUG, "reply_dispatch", bytes = data.len());
                let _guard = span.enter();
                reader.feed(&data);
                loop {
                    match reader.try_read() {
                        Ok(Some(reply)) => shared.dispatch_reply(reply),
                        Ok(None) => break,
                        Err(err) => {
                            warn!("fatal reply parsing error: {}", err);
                            // the resulting Closed event fails the queue
                            conn.disconnect();
                            break;
                        }
                    }
                }
            }
            ConnectionEvent::Closed => {
                debug!("connection closed, failing pending replies");
                shared.fail_all_pending();
                break;
            }
        }
    }
}

/// High level object to interact with redis: request/reply multiplexing
/// over a single connection, with pipelining. Replies come back in the
/// order commands were issued; server-side error replies are ordinary
/// [`Reply::Error`] values so a pipeline can carry partial successes.
pub struct Client {
    opts: ClientOptions,
    shared: Arc<Shared>,
    conn: Mutex<Option<Arc<Connection>>>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl Client {
    pub fn new(opts: ClientOptions) -> Client {
        Client {
            opts,
            shared: Arc::new(Shared::new()),
            conn: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.opts
    }

    fn current_connection(&self) -> Option<Arc<Connection>> {
        self.conn.lock().unwrap().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.current_connection()
            .map(|c| c.is_connected())
            .unwrap_or(false)
    }

    /// Wall time since the underlying connection last changed state;
    /// `None` when the client never connected.
    pub fn last_change_delta(&self) -> Option<Duration> {
        self.current_connection().map(|c| c.last_change_delta())
    }

    // stable identity of this client instance, for pool bookkeeping tests
    pub(crate) fn instance_id(&self) -> usize {
        Arc::as_ptr(&self.shared) as usize
    }

    pub(crate) fn is_subscribed(&self) -> bool {
        self.shared.subscribed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_subscribed(&self, value: bool) {
        self.shared.subscribed.store(value, Ordering::SeqCst);
    }

    /// Connects the client. Idempotent when already connected. When a
    /// password or a database index is configured, `AUTH`/`SELECT` run
    /// before the method resolves; a refusal tears the transport down
    /// and surfaces as an error.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        // fresh connection: drop leftovers of the previous lifetime
        self.shared.pending.lock().unwrap().clear();
        self.shared.reply_list.lock().unwrap().clear();
        self.set_subscribed(false);

        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection::new(self.opts.connection_options(), tx));
        conn.connect().await?;
        tokio::spawn(dispatch_loop(self.shared.clone(), conn.clone(), rx));

        if let Some(password) = self.opts.password.clone() {
            let reply = self
                .request(&conn, vec!["AUTH".into(), password.into()])
                .await?;
            if !reply.is_ok_status() {
                warn!("authentication rejected by the server");
                conn.disconnect();
                return Err(Error::connection("authentication failed"));
            }
        }
        if let Some(db) = self.opts.db {
            let reply = self.request(&conn, vec!["SELECT".into(), db.into()]).await?;
            if !reply.is_ok_status() {
                warn!("can't select database {}", db);
                conn.disconnect();
                return Err(Error::connection(format!("can't select database {}", db)));
            }
        }
        *self.conn.lock().unwrap() = Some(conn);
        Ok(())
    }

    /// Disconnects the client. Pending requests resolve to connection
    /// errors as the close event drains through the dispatch loop.
    pub fn disconnect(&self) {
        if let Some(conn) = self.conn.lock().unwrap().take() {
            conn.disconnect();
        }
    }

    async fn ensure_connected(&self) -> Result<Arc<Connection>> {
        if let Some(conn) = self.current_connection() {
            if conn.is_connected() {
                return Ok(conn);
            }
        }
        if !self.opts.autoconnect {
            return Err(Error::connection("you are not connected"));
        }
        self.connect().await?;
        self.current_connection()
            .ok_or_else(|| Error::connection("connect failed"))
    }

    // Enqueueing the entry and buffering the bytes happen under the
    // pending lock: concurrent callers cannot interleave their queue
    // position with someone else's bytes.
    fn send_command(
        &self,
        conn: &Connection,
        buf: crate::buffer::WriteBuffer,
        entry: PendingEntry,
    ) -> Result<()> {
        let mut pending = self.shared.pending.lock().unwrap();
        conn.write(buf)?;
        pending.push_back(entry);
        Ok(())
    }

    // Single request/reply against an explicit connection, used before
    // the connection is published (AUTH/SELECT) and by call().
    async fn request(&self, conn: &Connection, args: Vec<Argument>) -> Result<Reply> {
        let buf = format_command(args)?;
        let (tx, rx) = oneshot::channel();
        self.send_command(conn, buf, PendingEntry::Single(tx))?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::connection("connection to redis closed")),
        }
    }

    /// Calls a redis command and waits for the reply.
    pub async fn call(&self, args: Vec<Argument>) -> Result<Reply> {
        self.ensure_plain_mode()?;
        let conn = self.ensure_connected().await?;
        self.request(&conn, args).await
    }

    /// Calls a whole pipeline; the reply list has exactly one entry per
    /// stacked command, in stacking order.
    pub async fn call_pipeline(&self, pipeline: Pipeline) -> Result<Vec<Reply>> {
        self.ensure_plain_mode()?;
        let count = pipeline.stacked_count();
        if count == 0 {
            return Err(Error::client("empty pipeline"));
        }
        let conn = self.ensure_connected().await?;
        let mut buf = crate::buffer::WriteBuffer::new();
        for args in pipeline.into_args() {
            buf.append_buffer(format_command(args)?);
        }
        let (tx, rx) = oneshot::channel();
        let agg = Arc::new(Mutex::new(Aggregate {
            remaining: count,
            replies: Vec::with_capacity(count),
            tx: Some(tx),
        }));
        {
            let mut pending = self.shared.pending.lock().unwrap();
            conn.write(buf)?;
            for _ in 0..count {
                pending.push_back(PendingEntry::Aggregating(agg.clone()));
            }
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::connection("connection to redis closed")),
        }
    }

    // Sends one command but expects `reply_count` consecutive replies
    // (the subscribe/unsubscribe confirmation shape).
    pub(crate) async fn call_multiple_replies(
        &self,
        args: Vec<Argument>,
        reply_count: usize,
    ) -> Result<Vec<Reply>> {
        let conn = self.ensure_connected().await?;
        let buf = format_command(args)?;
        let (tx, rx) = oneshot::channel();
        let agg = Arc::new(Mutex::new(Aggregate {
            remaining: reply_count,
            replies: Vec::with_capacity(reply_count),
            tx: Some(tx),
        }));
        {
            let mut pending = self.shared.pending.lock().unwrap();
            conn.write(buf)?;
            for _ in 0..reply_count {
                pending.push_back(PendingEntry::Aggregating(agg.clone()));
            }
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::connection("connection to redis closed")),
        }
    }

    /// Fire-and-forget call: the reply goes to `callback` when given,
    /// and is discarded otherwise. Resolves once the command is
    /// buffered, not when the server answers.
    pub async fn async_call(
        &self,
        args: Vec<Argument>,
        callback: Option<ReplyCallback>,
        discard_reply: bool,
    ) -> Result<()> {
        if discard_reply && callback.is_some() {
            return Err(Error::client(
                "discard_reply and callback options are not compatible",
            ));
        }
        self.ensure_plain_mode()?;
        let conn = self.ensure_connected().await?;
        let buf = format_command(args)?;
        let entry = match callback {
            Some(cb) => PendingEntry::Callback(cb),
            None => PendingEntry::Discard,
        };
        self.send_command(&conn, buf, entry)
    }

    fn ensure_plain_mode(&self) -> Result<()> {
        if self.is_subscribed() {
            return Err(Error::client(
                "this client is in subscription mode, only pubsub commands are allowed",
            ));
        }
        Ok(())
    }

    /// Pops one undispatched pub/sub reply, waiting up to `deadline`
    /// when the list is empty (forever without a deadline). A timeout
    /// yields `Ok(None)`; a closed connection yields an error.
    pub(crate) async fn pop_reply(&self, deadline: Option<Duration>) -> Result<Option<Reply>> {
        let started = tokio::time::Instant::now();
        loop {
            {
                let mut list = self.shared.reply_list.lock().unwrap();
                match list.pop_front() {
                    Some(PubSubItem::Message(reply)) => return Ok(Some(reply)),
                    Some(PubSubItem::ConnectionClosed) => {
                        return Err(Error::connection("connection to redis closed by the server"))
                    }
                    None => {}
                }
            }
            match deadline {
                None => self.shared.reply_notify.notified().await,
                Some(limit) => {
                    let remaining = match limit.checked_sub(started.elapsed()) {
                        Some(remaining) => remaining,
                        None => return Ok(None),
                    };
                    if tokio::time::timeout(remaining, self.shared.reply_notify.notified())
                        .await
                        .is_err()
                    {
                        return Ok(None);
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("host", &self.opts.host)
            .field("port", &self.opts.port)
            .field("connected", &self.is_connected())
            .finish()
    }
}
