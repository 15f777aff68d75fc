//! Scripted in-process redis stand-in for the test suite: enough of the
//! command surface to exercise the client (strings, auth, pub/sub) plus
//! failure injection (HANG, CLOSE, KILLALL).

use crate::client::ClientOptions;
use crate::codec::{read_reply, Reply};
use bytes::{BufMut, Bytes, BytesMut};
use log::debug;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

enum Outbound {
    Frame(Bytes),
    Close,
}

struct ConnEntry {
    out: mpsc::UnboundedSender<Outbound>,
    channels: Vec<Bytes>,
    patterns: Vec<Bytes>,
}

struct ServerState {
    password: Option<String>,
    data: Mutex<HashMap<Bytes, Bytes>>,
    connections: Mutex<HashMap<usize, ConnEntry>>,
    conn_epoch: AtomicUsize,
}

impl ServerState {
    fn close_all(&self) {
        let connections = self.connections.lock().unwrap();
        for entry in connections.values() {
            let _ = entry.out.send(Outbound::Close);
        }
    }
}

pub(crate) struct MockServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    accept_task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> MockServer {
        MockServer::with_password(None).await
    }

    pub async fn start_with_password(password: &str) -> MockServer {
        MockServer::with_password(Some(password.to_owned())).await
    }

    async fn with_password(password: Option<String>) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(ServerState {
            password,
            data: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            conn_epoch: AtomicUsize::new(0),
        });
        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let epoch = accept_state.conn_epoch.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(connection_loop(accept_state.clone(), stream, epoch));
            }
        });
        MockServer {
            addr,
            state,
            accept_task,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
            ..ClientOptions::default()
        }
    }

    /// Stops accepting and closes every live connection.
    pub fn stop(&self) {
        self.accept_task.abort();
        self.state.close_all();
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn crlf(out: &mut BytesMut) {
    out.extend_from_slice(b"\r\n");
}

fn write_reply(out: &mut BytesMut, reply: &Reply) {
    match reply {
        Reply::SimpleString(s) => {
            out.put_u8(b'+');
            out.extend_from_slice(s);
            crlf(out);
        }
        Reply::Error(e) => {
            out.put_u8(b'-');
            out.extend_from_slice(e);
            crlf(out);
        }
        Reply::Integer(i) => {
            out.put_u8(b':');
            out.extend_from_slice(i.to_string().as_bytes());
            crlf(out);
        }
        Reply::BulkString(None) => out.extend_from_slice(b"$-1\r\n"),
        Reply::BulkString(Some(s)) => {
            out.put_u8(b'$');
            out.extend_from_slice(s.len().to_string().as_bytes());
            crlf(out);
            out.extend_from_slice(s);
            crlf(out);
        }
        Reply::Array(None) => out.extend_from_slice(b"*-1\r\n"),
        Reply::Array(Some(items)) => {
            out.put_u8(b'*');
            out.extend_from_slice(items.len().to_string().as_bytes());
            crlf(out);
            for item in items {
                write_reply(out, item);
            }
        }
    }
}

fn encode_reply(reply: &Reply) -> Bytes {
    let mut out = BytesMut::new();
    write_reply(&mut out, reply);
    out.freeze()
}

fn bulk(data: &[u8]) -> Reply {
    Reply::BulkString(Some(Bytes::copy_from_slice(data)))
}

fn status(data: &'static str) -> Reply {
    Reply::SimpleString(Bytes::from_static(data.as_bytes()))
}

fn error(message: String) -> Reply {
    Reply::Error(Bytes::from(message.into_bytes()))
}

fn parse_frame(buff: &mut BytesMut) -> Result<Option<Reply>, ()> {
    if buff.is_empty() {
        return Ok(None);
    }
    let size = buff.len();
    match read_reply(&buff[..]) {
        Ok((rem, frame)) => {
            let rem_size = rem.len();
            let _ = buff.split_to(size - rem_size);
            Ok(Some(frame))
        }
        Err(nom::Err::Incomplete(_)) => Ok(None),
        Err(_) => Err(()),
    }
}

fn command_args(frame: &Reply) -> Option<Vec<Bytes>> {
    let items = frame.as_array()?;
    items.iter().map(|item| item.as_bytes().cloned()).collect()
}

fn pattern_matches(pattern: &[u8], channel: &[u8]) -> bool {
    // glob subset: a single trailing star, everything else is literal
    match pattern.split_last() {
        Some((b'*', prefix)) => channel.starts_with(prefix),
        _ => pattern == channel,
    }
}

async fn connection_loop(state: Arc<ServerState>, stream: TcpStream, epoch: usize) {
    debug!("mock server: connection {} accepted", epoch);
    let (mut reader, mut writer) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
    state.connections.lock().unwrap().insert(
        epoch,
        ConnEntry {
            out: out_tx.clone(),
            channels: Vec::new(),
            patterns: Vec::new(),
        },
    );
    let writer_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            match msg {
                Outbound::Frame(frame) => {
                    if writer.write_all(&frame).await.is_err() {
                        break;
                    }
                    let _ = writer.flush().await;
                }
                Outbound::Close => break,
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut buff = BytesMut::with_capacity(4096);
    let mut authed = state.password.is_none();
    'conn: loop {
        let frame = loop {
            match parse_frame(&mut buff) {
                Ok(Some(frame)) => break frame,
                Ok(None) => match reader.read_buf(&mut buff).await {
                    Ok(0) => break 'conn,
                    Ok(_) => {}
                    Err(_) => break 'conn,
                },
                Err(()) => break 'conn,
            }
        };
        let args = match command_args(&frame) {
            Some(args) if !args.is_empty() => args,
            _ => break 'conn,
        };
        if !handle_command(&state, epoch, &args, &mut authed, &out_tx) {
            break 'conn;
        }
    }
    state.connections.lock().unwrap().remove(&epoch);
    drop(out_tx);
    let _ = writer_task.await;
    debug!("mock server: connection {} dropped", epoch);
}

fn send_frame(out: &mpsc::UnboundedSender<Outbound>, reply: &Reply) {
    let _ = out.send(Outbound::Frame(encode_reply(reply)));
}

// returns false when the connection must be dropped
fn handle_command(
    state: &Arc<ServerState>,
    epoch: usize,
    args: &[Bytes],
    authed: &mut bool,
    out: &mpsc::UnboundedSender<Outbound>,
) -> bool {
    let command = args[0].to_ascii_uppercase();
    if &command[..] == b"AUTH" {
        let accepted = match (&state.password, args.get(1)) {
            (Some(password), Some(given)) => password.as_bytes() == &given[..],
            _ => false,
        };
        if accepted {
            *authed = true;
            send_frame(out, &status("OK"));
        } else {
            send_frame(out, &error("ERR invalid password".to_owned()));
        }
        return true;
    }
    if !*authed {
        send_frame(out, &error("NOAUTH Authentication required.".to_owned()));
        return true;
    }
    match &command[..] {
        b"PING" => send_frame(out, &status("PONG")),
        b"ECHO" => match args.get(1) {
            Some(payload) => send_frame(out, &bulk(payload)),
            None => send_frame(out, &error("ERR wrong number of arguments".to_owned())),
        },
        b"SET" => match (args.get(1), args.get(2)) {
            (Some(key), Some(value)) => {
                state.data.lock().unwrap().insert(key.clone(), value.clone());
                send_frame(out, &status("OK"));
            }
            _ => send_frame(out, &error("ERR wrong number of arguments".to_owned())),
        },
        b"GET" => match args.get(1) {
            Some(key) => {
                let value = state.data.lock().unwrap().get(key).cloned();
                match value {
                    Some(value) => send_frame(out, &bulk(&value)),
                    None => send_frame(out, &Reply::BulkString(None)),
                }
            }
            None => send_frame(out, &error("ERR wrong number of arguments".to_owned())),
        },
        b"SELECT" => {
            let valid = args
                .get(1)
                .and_then(|raw| std::str::from_utf8(raw).ok())
                .map(|raw| raw.parse::<i64>().is_ok())
                .unwrap_or(false);
            if valid {
                send_frame(out, &status("OK"));
            } else {
                send_frame(out, &error("ERR invalid DB index".to_owned()));
            }
        }
        b"SUBSCRIBE" => subscription_update(state, epoch, args, "subscribe", out),
        b"PSUBSCRIBE" => subscription_update(state, epoch, args, "psubscribe", out),
        b"UNSUBSCRIBE" => subscription_update(state, epoch, args, "unsubscribe", out),
        b"PUNSUBSCRIBE" => subscription_update(state, epoch, args, "punsubscribe", out),
        b"PUBLISH" => {
            if let (Some(channel), Some(payload)) = (args.get(1), args.get(2)) {
                let receivers = publish(state, channel, payload);
                send_frame(out, &Reply::Integer(receivers));
            } else {
                send_frame(out, &error("ERR wrong number of arguments".to_owned()));
            }
        }
        // failure injection for the tests
        b"HANG" => {}
        b"CLOSE" => return false,
        b"KILLALL" => {
            state.close_all();
            return false;
        }
        other => send_frame(
            out,
            &error(format!(
                "ERR unknown command '{}'",
                String::from_utf8_lossy(other)
            )),
        ),
    }
    true
}

fn subscription_update(
    state: &Arc<ServerState>,
    epoch: usize,
    args: &[Bytes],
    kind: &'static str,
    out: &mpsc::UnboundedSender<Outbound>,
) {
    let mut connections = state.connections.lock().unwrap();
    let entry = match connections.get_mut(&epoch) {
        Some(entry) => entry,
        None => return,
    };
    let pattern_op = kind.starts_with('p');
    let adding = !kind.contains("unsub");
    for name in &args[1..] {
        {
            let set = if pattern_op {
                &mut entry.patterns
            } else {
                &mut entry.channels
            };
            if adding {
                if !set.contains(name) {
                    set.push(name.clone());
                }
            } else {
                set.retain(|existing| existing != name);
            }
        }
        let count = (entry.channels.len() + entry.patterns.len()) as i64;
        let confirmation = Reply::Array(Some(vec![
            bulk(kind.as_bytes()),
            bulk(name),
            Reply::Integer(count),
        ]));
        send_frame(out, &confirmation);
    }
}

fn publish(state: &Arc<ServerState>, channel: &Bytes, payload: &Bytes) -> i64 {
    let connections = state.connections.lock().unwrap();
    let mut receivers = 0i64;
    for entry in connections.values() {
        if entry.channels.contains(channel) {
            let message = Reply::Array(Some(vec![
                bulk(b"message"),
                bulk(channel),
                bulk(payload),
            ]));
            let _ = entry.out.send(Outbound::Frame(encode_reply(&message)));
            receivers += 1;
        }
        for pattern in &entry.patterns {
            if pattern_matches(pattern, channel) {
                let message = Reply::Array(Some(vec![
                    bulk(b"pmessage"),
                    bulk(pattern),
                    bulk(channel),
                    bulk(payload),
                ]));
                let _ = entry.out.send(Outbound::Frame(encode_reply(&message)));
                receivers += 1;
            }
        }
    }
    receivers
}
