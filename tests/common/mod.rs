//! An in-process nsqd speaking just enough of the TCP protocol for the
//! integration tests, and a canned-response HTTP server standing in for
//! nsqlookupd.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

#[derive(Debug, Clone, Default)]
pub struct Options {
    pub auth_required: bool,
    /// Push every queued message regardless of RDY.
    pub ignore_rdy: bool,
}

#[derive(Debug, Clone)]
struct Msg {
    id: String,
    body: Vec<u8>,
    attempts: u16,
}

#[derive(Default)]
struct Topic {
    backlog: VecDeque<Msg>,
    channels: HashMap<String, VecDeque<Msg>>,
}

impl Topic {
    fn put(&mut self, msg: Msg) {
        if self.channels.is_empty() {
            self.backlog.push_back(msg);
        } else {
            for queue in self.channels.values_mut() {
                queue.push_back(msg.clone());
            }
        }
    }

    fn channel(&mut self, name: &str) -> &mut VecDeque<Msg> {
        if !self.channels.contains_key(name) {
            let backlog = if self.channels.is_empty() {
                std::mem::take(&mut self.backlog)
            } else {
                VecDeque::new()
            };
            self.channels.insert(name.to_owned(), backlog);
        }
        self.channels.get_mut(name).unwrap()
    }
}

#[derive(Default)]
struct State {
    topics: HashMap<String, Topic>,
    log: Vec<String>,
    next_id: u64,
    in_flight: usize,
}

impl State {
    fn put(&mut self, topic: &str, body: Vec<u8>) {
        self.next_id += 1;
        let msg = Msg { id: format!("{:016x}", self.next_id), body, attempts: 0 };
        self.topics.entry(topic.to_owned()).or_default().put(msg);
    }
}

#[derive(Debug, Clone, Copy)]
enum Event {
    Deliver,
    Heartbeat,
    Disconnect,
}

pub struct MockNsqd {
    addr: SocketAddr,
    state: Arc<Mutex<State>>,
    events: broadcast::Sender<Event>,
}

impl MockNsqd {
    pub async fn start() -> Self {
        Self::start_with(Options::default()).await
    }

    pub async fn start_with(options: Options) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(State::default()));
        let (events, _) = broadcast::channel(64);

        let accept_state = Arc::clone(&state);
        let accept_events = events.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let conn = Serve {
                    state: Arc::clone(&accept_state),
                    events: accept_events.clone(),
                    options: options.clone(),
                };
                tokio::spawn(conn.run(stream, accept_events.subscribe()));
            }
        });

        Self { addr, state, events }
    }

    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    /// Queue a message as if it had been published.
    pub fn put(&self, topic: &str, body: &[u8]) {
        self.state.lock().unwrap().put(topic, body.to_vec());
        let _ = self.events.send(Event::Deliver);
    }

    pub fn heartbeat(&self) {
        let _ = self.events.send(Event::Heartbeat);
    }

    /// Drop every client connection.
    pub fn disconnect(&self) {
        let _ = self.events.send(Event::Disconnect);
    }

    /// Every command line received, in order, plus `> ...` lines for what the mock sent unprompted.
    pub fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    /// Bodies published to a topic no channel has subscribed to yet.
    pub fn backlog(&self, topic: &str) -> Vec<Vec<u8>> {
        let state = self.state.lock().unwrap();
        state.topics.get(topic)
            .map(|t| t.backlog.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Messages waiting in a channel, not counting in-flight ones.
    pub fn depth(&self, topic: &str, channel: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.topics.get(topic)
            .and_then(|t| t.channels.get(channel))
            .map(|q| q.len())
            .unwrap_or(0)
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().unwrap().in_flight
    }

    /// Poll until `pred` holds, failing the test after 5s.
    pub async fn wait_for<F: Fn(&MockNsqd) -> bool>(&self, pred: F) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !pred(self) {
            if tokio::time::Instant::now() > deadline {
                panic!("condition not met, log: {:#?}", self.log());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.log().iter().filter(|l| l.starts_with(prefix)).count()
    }
}

#[derive(Debug)]
enum Kind {
    Identify(Value),
    Pub(String, Vec<Vec<u8>>),
    Sub(String, String),
    Rdy(u64),
    Fin(String),
    Req(String),
    Touch,
    Cls,
    Nop,
    Invalid,
}

#[derive(Debug)]
struct Cmd {
    line: String,
    kind: Kind,
}

#[derive(Default)]
struct Conn {
    sub: Option<(String, String)>,
    rdy: u64,
    in_flight: HashMap<String, Msg>,
    closing: bool,
}

struct Serve {
    state: Arc<Mutex<State>>,
    events: broadcast::Sender<Event>,
    options: Options,
}

impl Serve {
    async fn run(self, stream: TcpStream, mut events: broadcast::Receiver<Event>) {
        let (rd, mut wr) = stream.into_split();
        let (tx, mut commands) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let _ = read_commands(rd, tx).await;
        });

        let mut conn = Conn::default();
        loop {
            let (out, keep_going) = tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle(cmd, &mut conn),
                    None => (Vec::new(), false),
                },
                event = events.recv() => match event {
                    Ok(Event::Heartbeat) => {
                        self.state.lock().unwrap().log.push("> _heartbeat_".into());
                        (frame(0, b"_heartbeat_"), true)
                    }
                    Ok(Event::Deliver) | Err(broadcast::error::RecvError::Lagged(_)) => (Vec::new(), true),
                    Ok(Event::Disconnect) | Err(broadcast::error::RecvError::Closed) => (Vec::new(), false),
                },
            };
            if write(&mut wr, &out).await.is_err() || !keep_going {
                break;
            }
            let out = self.deliver(&mut conn);
            if write(&mut wr, &out).await.is_err() {
                break;
            }
        }

        // unacknowledged messages go back to their channel
        let mut state = self.state.lock().unwrap();
        if let Some((topic, channel)) = conn.sub {
            let n = conn.in_flight.len();
            state.in_flight -= n;
            let queue = state.topics.entry(topic).or_default().channel(&channel);
            for (_, msg) in conn.in_flight {
                queue.push_front(msg);
            }
        }
    }

    fn handle(&self, cmd: Cmd, conn: &mut Conn) -> (Vec<u8>, bool) {
        let mut state = self.state.lock().unwrap();
        state.log.push(cmd.line.clone());

        match cmd.kind {
            Kind::Identify(client) => {
                if client["feature_negotiation"] == true {
                    let resp = json!({
                        "max_rdy_count": 2500,
                        "version": "1.2.1",
                        "max_msg_timeout": 900000,
                        "msg_timeout": 60000,
                        "tls_v1": false,
                        "deflate": false,
                        "deflate_level": 6,
                        "max_deflate_level": 6,
                        "snappy": false,
                        "sample_rate": 0,
                        "auth_required": self.options.auth_required,
                        "output_buffer_size": 16384,
                        "output_buffer_timeout": 250,
                    });
                    (frame(0, resp.to_string().as_bytes()), true)
                } else {
                    (frame(0, b"OK"), true)
                }
            }
            Kind::Pub(topic, bodies) => {
                if !valid_name(&topic) {
                    let e = format!("E_BAD_TOPIC PUB topic name \"{}\" is not valid", topic);
                    return (frame(1, e.as_bytes()), false);
                }
                for body in bodies {
                    state.put(&topic, body);
                }
                let _ = self.events.send(Event::Deliver);
                (frame(0, b"OK"), true)
            }
            Kind::Sub(topic, channel) => {
                if conn.sub.is_some() {
                    return (frame(1, b"E_INVALID cannot SUB in current state"), false);
                }
                state.topics.entry(topic.clone()).or_default().channel(&channel);
                conn.sub = Some((topic, channel));
                (frame(0, b"OK"), true)
            }
            Kind::Rdy(count) => {
                conn.rdy = count;
                (Vec::new(), true)
            }
            Kind::Fin(id) => {
                if conn.in_flight.remove(&id).is_some() {
                    state.in_flight -= 1;
                    (Vec::new(), true)
                } else {
                    let e = format!("E_FIN_FAILED FIN {} failed ID not in flight", id);
                    (frame(1, e.as_bytes()), true)
                }
            }
            Kind::Req(id) => {
                match (conn.in_flight.remove(&id), conn.sub.clone()) {
                    (Some(msg), Some((topic, channel))) => {
                        state.in_flight -= 1;
                        state.topics.entry(topic).or_default().channel(&channel).push_front(msg);
                        (Vec::new(), true)
                    }
                    _ => {
                        let e = format!("E_REQ_FAILED REQ {} failed ID not in flight", id);
                        (frame(1, e.as_bytes()), true)
                    }
                }
            }
            Kind::Touch | Kind::Nop => (Vec::new(), true),
            Kind::Cls => {
                conn.closing = true;
                (frame(0, b"CLOSE_WAIT"), true)
            }
            Kind::Invalid => (frame(1, b"E_INVALID invalid command"), false),
        }
    }

    fn deliver(&self, conn: &mut Conn) -> Vec<u8> {
        let mut out = Vec::new();
        let (topic, channel) = match conn.sub {
            Some(ref sub) if !conn.closing => sub.clone(),
            _ => return out,
        };
        let mut state = self.state.lock().unwrap();
        loop {
            if !self.options.ignore_rdy && conn.in_flight.len() as u64 >= conn.rdy {
                break;
            }
            let queue = state.topics.entry(topic.clone()).or_default().channel(&channel);
            let mut msg = match queue.pop_front() {
                Some(msg) => msg,
                None => break,
            };
            msg.attempts += 1;
            out.extend(message_frame(&msg));
            conn.in_flight.insert(msg.id.clone(), msg);
            state.in_flight += 1;
        }
        out
    }
}

async fn write(wr: &mut OwnedWriteHalf, bytes: &[u8]) -> io::Result<()> {
    if bytes.is_empty() {
        return Ok(());
    }
    wr.write_all(bytes).await
}

async fn read_commands(rd: OwnedReadHalf, tx: mpsc::UnboundedSender<Cmd>) -> io::Result<()> {
    let mut rd = BufReader::new(rd);
    let mut magic = [0u8; 4];
    rd.read_exact(&mut magic).await?;
    if &magic != b"  V2" {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad magic"));
    }

    loop {
        let mut line = String::new();
        if rd.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let line = line.trim_end().to_owned();
        let parts: Vec<String> = line.split(' ').map(str::to_owned).collect();
        let arg = |i: usize| parts.get(i).cloned().unwrap_or_default();

        let kind = match parts[0].as_str() {
            "IDENTIFY" => {
                let body = read_body(&mut rd).await?;
                Kind::Identify(serde_json::from_slice(&body).unwrap_or(Value::Null))
            }
            "PUB" | "DPUB" => Kind::Pub(arg(1), vec![read_body(&mut rd).await?]),
            "MPUB" => {
                let body = read_body(&mut rd).await?;
                Kind::Pub(arg(1), split_mpub(&body))
            }
            "SUB" => Kind::Sub(arg(1), arg(2)),
            "RDY" => Kind::Rdy(arg(1).parse().unwrap_or(0)),
            "FIN" => Kind::Fin(arg(1)),
            "REQ" => Kind::Req(arg(1)),
            "TOUCH" => Kind::Touch,
            "CLS" => Kind::Cls,
            "NOP" => Kind::Nop,
            _ => Kind::Invalid,
        };
        if tx.send(Cmd { line, kind }).is_err() {
            return Ok(());
        }
    }
}

async fn read_body(rd: &mut BufReader<OwnedReadHalf>) -> io::Result<Vec<u8>> {
    let len = rd.read_u32().await? as usize;
    let mut body = vec![0u8; len];
    rd.read_exact(&mut body).await?;
    Ok(body)
}

fn split_mpub(body: &[u8]) -> Vec<Vec<u8>> {
    let u32_at = |at: usize| u32::from_be_bytes([body[at], body[at + 1], body[at + 2], body[at + 3]]) as usize;
    let count = u32_at(0);
    let mut at = 4;
    let mut msgs = Vec::with_capacity(count);
    for _ in 0..count {
        let len = u32_at(at);
        msgs.push(body[at + 4..at + 4 + len].to_vec());
        at += 4 + len;
    }
    msgs
}

fn valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || "._-#".contains(c))
}

pub fn frame(frame_type: i32, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 8);
    out.extend_from_slice(&((data.len() + 4) as i32).to_be_bytes());
    out.extend_from_slice(&frame_type.to_be_bytes());
    out.extend_from_slice(data);
    out
}

fn message_frame(msg: &Msg) -> Vec<u8> {
    let mut data = Vec::with_capacity(26 + msg.body.len());
    data.extend_from_slice(&1_700_000_000_000_000_000i64.to_be_bytes());
    data.extend_from_slice(&msg.attempts.to_be_bytes());
    data.extend_from_slice(msg.id.as_bytes());
    data.extend_from_slice(&msg.body);
    frame(2, &data)
}

/// Serve canned nsqlookupd responses. Routes match on the start of `path?query`;
/// anything else gets a 404.
pub async fn lookupd(routes: Vec<(&'static str, u16, String)>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let routes = Arc::new(routes);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let routes = Arc::clone(&routes);
            tokio::spawn(async move {
                let _ = respond(stream, &routes).await;
            });
        }
    });

    format!("http://{}", addr)
}

async fn respond(stream: TcpStream, routes: &[(&'static str, u16, String)]) -> io::Result<()> {
    let (rd, mut wr) = stream.into_split();
    let mut rd = BufReader::new(rd);
    let mut request_line = String::new();
    rd.read_line(&mut request_line).await?;
    loop {
        let mut header = String::new();
        if rd.read_line(&mut header).await? == 0 || header == "\r\n" {
            break;
        }
    }

    let path = request_line.split(' ').nth(1).unwrap_or("/");
    let (status, body) = routes.iter()
        .find(|(prefix, _, _)| path.starts_with(prefix))
        .map(|(_, status, body)| (*status, body.clone()))
        .unwrap_or((404, r#"{"message":"NOT_FOUND"}"#.to_owned()));

    let resp = format!(
        "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status, body.len(), body,
    );
    wr.write_all(resp.as_bytes()).await?;
    wr.shutdown().await
}
