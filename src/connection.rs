use crate::buffer::WriteBuffer;
use crate::errors::{Error, Result};
use crate::state::{ConnectionState, StateCell};
use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, warn};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Notify};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 6379;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_READ_PAGE_SIZE: usize = 65536;
pub const DEFAULT_WRITE_PAGE_SIZE: usize = 65536;

/// Transport-level configuration shared by `Client` and `ClientPool`.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub host: String,
    pub port: u16,
    /// Path to a unix domain socket; overrides host/port when set.
    pub unix_socket: Option<PathBuf>,
    pub connect_timeout: Duration,
    /// Max bytes moved per read syscall.
    pub read_page_size: usize,
    /// Max bytes moved per write syscall.
    pub write_page_size: usize,
    pub tcp_nodelay: bool,
    /// Flush after every chunk instead of once the outbound buffer is
    /// drained: lower latency, lower throughput.
    pub aggressive_write: bool,
}

impl Default for ConnectionOptions {
    fn default() -> ConnectionOptions {
        ConnectionOptions {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            unix_socket: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_page_size: DEFAULT_READ_PAGE_SIZE,
            write_page_size: DEFAULT_WRITE_PAGE_SIZE,
            tcp_nodelay: false,
            aggressive_write: false,
        }
    }
}

impl ConnectionOptions {
    fn peer_label(&self) -> String {
        match &self.unix_socket {
            Some(path) => format!("{}", path.display()),
            None => format!("{}:{}", self.host, self.port),
        }
    }
}

/// What the connection reports back to its owner: inbound bytes, and a
/// single close notification per connected lifetime.
#[derive(Debug)]
pub enum ConnectionEvent {
    Data(Bytes),
    Closed,
}

enum Transport {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Transport::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Transport::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Transport::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Transport::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

async fn open_transport(opts: &ConnectionOptions) -> Result<Transport> {
    #[cfg(unix)]
    if let Some(path) = &opts.unix_socket {
        let stream = UnixStream::connect(path).await?;
        return Ok(Transport::Unix(stream));
    }
    #[cfg(not(unix))]
    if opts.unix_socket.is_some() {
        return Err(Error::client("unix sockets are not available on this platform"));
    }
    let stream = TcpStream::connect((opts.host.as_str(), opts.port)).await?;
    if opts.tcp_nodelay {
        stream.set_nodelay(true)?;
    }
    Ok(Transport::Tcp(stream))
}

/// Low level connection object.
///
/// Owns the socket, the shared outbound [`WriteBuffer`] and the state
/// cell, and drives two pump tasks: a read loop forwarding inbound
/// pages as [`ConnectionEvent::Data`] and a write loop draining the
/// buffer by `write_page_size` chunks. The owner receives events on the
/// mpsc channel handed to [`Connection::new`]; `Closed` is delivered
/// exactly once per connected lifetime.
pub struct Connection {
    opts: ConnectionOptions,
    state: Arc<StateCell>,
    write_buffer: Arc<Mutex<WriteBuffer>>,
    write_wake: Arc<Notify>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl Connection {
    pub fn new(opts: ConnectionOptions, events: mpsc::UnboundedSender<ConnectionEvent>) -> Connection {
        Connection {
            opts,
            state: Arc::new(StateCell::new()),
            write_buffer: Arc::new(Mutex::new(WriteBuffer::new())),
            write_wake: Arc::new(Notify::new()),
            events,
        }
    }

    pub fn state(&self) -> &Arc<StateCell> {
        &self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn is_connecting(&self) -> bool {
        self.state.is_connecting()
    }

    pub fn last_change_delta(&self) -> Duration {
        self.state.last_change_delta()
    }

    /// Connects to the peer. Safe to call when already connected or
    /// connecting: the former succeeds immediately, the latter awaits
    /// the pending attempt.
    pub async fn connect(&self) -> Result<()> {
        match self.state.get() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Connecting => {
                return match self.state.wait_for_change().await {
                    ConnectionState::Connected => Ok(()),
                    _ => Err(Error::connection("connect failed")),
                };
            }
            ConnectionState::Disconnected => {}
        }
        let peer = self.opts.peer_label();
        debug!("connecting to {}...", peer);
        self.state.transition(ConnectionState::Connecting);
        let transport = match tokio::time::timeout(self.opts.connect_timeout, open_transport(&self.opts)).await {
            Ok(Ok(transport)) => transport,
            Ok(Err(err)) => {
                self.drop_connection();
                return Err(Error::connection(format!("can't connect to {}: {}", peer, err)));
            }
            Err(_) => {
                self.drop_connection();
                return Err(Error::connection(format!("connection timeout to {}", peer)));
            }
        };
        debug!("connected to {}", peer);
        let (reader, writer) = io::split(transport);
        self.state.transition(ConnectionState::Connected);
        tokio::spawn(read_loop(
            reader,
            self.opts.read_page_size,
            self.state.clone(),
            self.events.clone(),
        ));
        tokio::spawn(write_loop(
            writer,
            self.write_buffer.clone(),
            self.write_wake.clone(),
            self.opts.write_page_size,
            self.opts.aggressive_write,
            self.state.clone(),
            self.events.clone(),
        ));
        Ok(())
    }

    /// Buffers outbound data and wakes the writer; never performs I/O
    /// and never suspends. Fails fast when the connection is down.
    pub fn write(&self, data: WriteBuffer) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::client("you are not connected"));
        }
        if !data.is_empty() {
            self.write_buffer.lock().unwrap().append_buffer(data);
            self.write_wake.notify_one();
        }
        Ok(())
    }

    /// Disconnects. Safe to call at any time, in any state; the pump
    /// tasks observe the transition and wind down on their own.
    pub fn disconnect(&self) {
        if !self.is_connected() && !self.is_connecting() {
            return;
        }
        debug!("disconnecting from {}...", self.opts.peer_label());
        self.drop_connection();
    }

    // The transition out of Connected/Connecting happens in exactly one
    // place per lifetime; the winner emits the Closed event.
    fn drop_connection(&self) {
        let prev = self.state.transition(ConnectionState::Disconnected);
        if prev != ConnectionState::Disconnected {
            let _ = self.events.send(ConnectionEvent::Closed);
        }
    }
}

fn announce_closed(state: &StateCell, events: &mpsc::UnboundedSender<ConnectionEvent>) {
    let prev = state.transition(ConnectionState::Disconnected);
    if prev != ConnectionState::Disconnected {
        let _ = events.send(ConnectionEvent::Closed);
    }
}

async fn read_loop(
    mut reader: io::ReadHalf<Transport>,
    page_size: usize,
    state: Arc<StateCell>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    let mut state_rx = state.subscribe();
    let mut buf = BytesMut::new();
    loop {
        buf.reserve(page_size);
        let res = tokio::select! {
            res = async {
                let mut limited = (&mut buf).limit(page_size);
                reader.read_buf(&mut limited).await
            } => Some(res),
            changed = state_rx.changed() => {
                if changed.is_err() || *state_rx.borrow() == ConnectionState::Disconnected {
                    return;
                }
                None
            }
        };
        match res {
            None => continue,
            Some(Ok(0)) => {
                debug!("closed socket => disconnecting");
                break;
            }
            Some(Ok(n)) => {
                debug!("{} bytes read from socket", n);
                if events.send(ConnectionEvent::Data(buf.split().freeze())).is_err() {
                    break;
                }
            }
            Some(Err(err)) => {
                warn!("error during socket read: {}", err);
                break;
            }
        }
    }
    announce_closed(&state, &events);
}

async fn write_loop(
    writer: io::WriteHalf<Transport>,
    buffer: Arc<Mutex<WriteBuffer>>,
    wake: Arc<Notify>,
    page_size: usize,
    aggressive: bool,
    state: Arc<StateCell>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    let mut writer = BufWriter::with_capacity(page_size, writer);
    let mut state_rx = state.subscribe();
    'pump: loop {
        tokio::select! {
            _ = wake.notified() => {}
            changed = state_rx.changed() => {
                if changed.is_err() || *state_rx.borrow() == ConnectionState::Disconnected {
                    break 'pump;
                }
                continue;
            }
        }
        loop {
            let chunk = { buffer.lock().unwrap().pop_chunk(page_size) };
            if chunk.is_empty() {
                break;
            }
            if let Err(err) = writer.write_all(&chunk).await {
                warn!("can't write to socket: {}", err);
                break 'pump;
            }
            debug!("{} bytes written to the socket", chunk.len());
            if aggressive {
                if let Err(err) = writer.flush().await {
                    warn!("can't flush socket: {}", err);
                    break 'pump;
                }
            }
        }
        if !aggressive {
            if let Err(err) = writer.flush().await {
                warn!("can't flush socket: {}", err);
                break 'pump;
            }
        }
    }
    let _ = writer.shutdown().await;
    announce_closed(&state, &events);
}
