//! In process server speaking enough of the binary protocol for unit tests.
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use bytes::{Bytes, BytesMut};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};

use crate::{
    codec::{Codec, CodecRegistry, EMPTY_TUPLE_CODEC_ID, NULL_CODEC_ID, ScalarCodec},
    common::Uuid,
    connection::{ConnectConfig, NormalizedConnectConfig, scram},
    protocol::{
        BufferError, ReadMessageBuffer, WriteMessageBuffer, auth, backend::read_headers, capabilities, headers,
    },
    value::Value,
};

const STR_ID: Uuid = Uuid::from_u16(0x101);
const INT64_ID: Uuid = Uuid::from_u16(0x105);
const BOOL_ID: Uuid = Uuid::from_u16(0x109);
/// `tuple<str>`
const STR_TUPLE_ID: Uuid = Uuid::from_u16(0xe01);

const SCRAM_ITERATIONS: u32 = 64;
const SCRAM_SALT: &[u8] = b"edgero-mock-salt";

const SERIALIZATION_ERROR: u32 = 0x05_03_01_01;
const CAPABILITY_ERROR: u32 = 0x03_04_00_00;

#[derive(Debug, Clone)]
enum ReplyKind {
    Rows(Vec<Value>),
    NoResult,
    Error(u32, String),
    Drop,
    /// Return the only `str` argument.
    EchoStr,
    /// Increment the shared counter, conflicting with concurrent transactions.
    Increment,
}

/// Scripted server behavior for a query.
#[derive(Debug, Clone)]
pub(crate) struct Reply {
    kind: ReplyKind,
    capabilities: u64,
    delay: Option<Duration>,
    /// Fail the first `n` runs with the given error code.
    fail: Option<(usize, u32)>,
}

impl Reply {
    fn new(kind: ReplyKind, capabilities: u64) -> Self {
        Self { kind, capabilities, delay: None, fail: None }
    }

    pub(crate) fn rows(rows: Vec<Value>) -> Self {
        Self::new(ReplyKind::Rows(rows), 0)
    }

    pub(crate) fn no_result() -> Self {
        Self::new(ReplyKind::NoResult, capabilities::MODIFICATIONS)
    }

    pub(crate) fn error(code: u32, message: &str) -> Self {
        Self::new(ReplyKind::Error(code, message.into()), 0)
    }

    /// Close the connection once the query is received.
    pub(crate) fn drop() -> Self {
        Self::new(ReplyKind::Drop, 0)
    }

    pub(crate) fn echo_str() -> Self {
        Self::new(ReplyKind::EchoStr, 0)
    }

    pub(crate) fn increment() -> Self {
        Self::new(ReplyKind::Increment, capabilities::MODIFICATIONS)
    }

    pub(crate) fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn failing(mut self, times: usize, code: u32) -> Self {
        self.fail = Some((times, code));
        self
    }

    pub(crate) fn with_capabilities(mut self, capabilities: u64) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// Server handshake behavior.
#[derive(Debug, Clone, Default)]
pub(crate) struct ServerOptions {
    version: Option<(u16, u16)>,
    scram: Option<(String, String)>,
    sasl_methods: Option<Vec<String>>,
    reject: Option<(u32, String)>,
}

impl ServerOptions {
    /// Require SCRAM-SHA-256 authentication.
    pub(crate) fn scram(user: &str, password: &str) -> Self {
        Self { scram: Some((user.into(), password.into())), ..Default::default() }
    }

    /// Offer SASL methods without completing the exchange.
    pub(crate) fn sasl_methods<I: IntoIterator<Item = S>, S: Into<String>>(mut self, methods: I) -> Self {
        self.sasl_methods = Some(methods.into_iter().map(Into::into).collect());
        self
    }

    pub(crate) fn version(mut self, major: u16, minor: u16) -> Self {
        self.version = Some((major, minor));
        self
    }

    /// Respond to the handshake with an error.
    pub(crate) fn reject(mut self, code: u32, message: &str) -> Self {
        self.reject = Some((code, message.into()));
        self
    }
}

#[derive(Debug, Default)]
struct Shared {
    replies: HashMap<String, Reply>,
    parse_counts: HashMap<String, usize>,
    scripts: Vec<String>,
    accepted: usize,
    counter: Option<i64>,
    version: u64,
}

type SharedRef = Arc<Mutex<Shared>>;

/// A server accepting connections until dropped.
pub(crate) struct MockServer {
    addr: SocketAddr,
    shared: SharedRef,
    handle: JoinHandle<()>,
}

impl MockServer {
    pub(crate) async fn start() -> MockServer {
        Self::start_with(ServerOptions::default()).await
    }

    pub(crate) async fn start_with(options: ServerOptions) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = SharedRef::default();

        let handle = tokio::spawn({
            let shared = shared.clone();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    shared.lock().unwrap().accepted += 1;
                    let mut peer = Peer::new(stream, shared.clone());
                    let options = options.clone();
                    tokio::spawn(async move {
                        // errors only mean the client went away
                        let _ = peer.serve(&options).await;
                    });
                }
            }
        });

        MockServer { addr, shared, handle }
    }

    /// Connection builder pointing to this server.
    pub(crate) fn connect_config(&self) -> ConnectConfig {
        ConnectConfig::new()
            .host("127.0.0.1")
            .port(self.addr.port())
            .user("edgedb")
            .database("edgedb")
            .wait_until_available(Duration::from_millis(100))
    }

    pub(crate) fn config(&self) -> NormalizedConnectConfig {
        self.connect_config().normalize_with(|_| None).unwrap()
    }

    pub(crate) fn config_with_password(&self, password: &str) -> NormalizedConnectConfig {
        self.connect_config().password(password).normalize_with(|_| None).unwrap()
    }

    pub(crate) fn reply(&self, query: &str, reply: Reply) {
        self.shared.lock().unwrap().replies.insert(query.into(), reply);
    }

    /// Number of `Parse` received for the query.
    pub(crate) fn parse_count(&self, query: &str) -> usize {
        self.shared.lock().unwrap().parse_counts.get(query).copied().unwrap_or(0)
    }

    /// Every `ExecuteScript` received, in order.
    pub(crate) fn scripts(&self) -> Vec<String> {
        self.shared.lock().unwrap().scripts.clone()
    }

    /// Number of accepted connections.
    pub(crate) fn accepted(&self) -> usize {
        self.shared.lock().unwrap().accepted
    }

    /// Committed value of the [`Reply::increment`] counter.
    pub(crate) fn counter(&self) -> Option<i64> {
        self.shared.lock().unwrap().counter
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Debug)]
struct Statement {
    query: String,
    format: u8,
    cardinality: u8,
    reply: Reply,
}

#[derive(Debug)]
enum Outcome {
    Continue,
    Close,
}

type PeerResult<T = ()> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

struct Peer {
    stream: TcpStream,
    read_buf: ReadMessageBuffer,
    write_buf: WriteMessageBuffer,
    shared: SharedRef,
    codecs: CodecRegistry,

    status: u8,
    /// `(counter, version)` at transaction start.
    snapshot: Option<(Option<i64>, u64)>,
    written: Option<i64>,
    statement: Option<Statement>,
    /// Discard messages until `Sync` after an error.
    skip_until_sync: bool,
}

impl Peer {
    fn new(stream: TcpStream, shared: SharedRef) -> Self {
        Self {
            stream,
            read_buf: ReadMessageBuffer::new(),
            write_buf: WriteMessageBuffer::new(),
            shared,
            codecs: CodecRegistry::new(),
            status: b'I',
            snapshot: None,
            written: None,
            statement: None,
            skip_until_sync: false,
        }
    }

    /// Wait for the next message, returns its type, `None` on EOF.
    async fn next(&mut self) -> PeerResult<Option<u8>> {
        loop {
            if self.read_buf.take_message()? {
                return Ok(self.read_buf.message_type());
            }
            let mut chunk = [0u8; 1024];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            self.read_buf.feed(&chunk[..n])?;
        }
    }

    async fn flush(&mut self) -> PeerResult {
        let bytes = self.write_buf.take()?;
        self.stream.write_all(&bytes).await?;
        Ok(())
    }

    fn message(&mut self, mtype: u8) -> Result<&mut WriteMessageBuffer, BufferError> {
        self.write_buf.begin_message(mtype)
    }

    fn auth(&mut self, status: i32, data: Option<&str>) -> Result<(), BufferError> {
        let buf = self.message(b'R')?.write_i32(status)?;
        if let Some(data) = data {
            buf.write_string(data)?;
        }
        buf.end_message()?;
        Ok(())
    }

    fn error(&mut self, code: u32, message: &str) -> Result<(), BufferError> {
        self.message(b'E')?
            .write_char(120)?
            .write_u32(code)?
            .write_string(message)?
            .write_headers(&[])?
            .end_message()?;
        Ok(())
    }

    fn ready(&mut self) -> Result<(), BufferError> {
        let status = self.status;
        self.message(b'Z')?.write_headers(&[])?.write_char(status)?.end_message()?;
        Ok(())
    }

    fn complete(&mut self) -> Result<(), BufferError> {
        self.message(b'C')?.write_headers(&[])?.write_string("OK")?.end_message()?;
        Ok(())
    }

    async fn serve(&mut self, options: &ServerOptions) -> PeerResult {
        if self.next().await? != Some(b'V') {
            return Ok(());
        }
        self.read_buf.discard_message();

        if let Some((major, minor)) = options.version {
            self.message(b'v')?.write_u16(major)?.write_u16(minor)?.write_u16(0)?.end_message()?;
        }

        if let Some((code, message)) = &options.reject {
            self.error(*code, message)?;
            return self.flush().await;
        }

        if let Some(methods) = &options.sasl_methods {
            let buf = self.message(b'R')?.write_i32(auth::AUTH_SASL)?.write_i32(methods.len() as i32)?;
            for method in methods {
                buf.write_string(method)?;
            }
            buf.end_message()?;
            self.flush().await?;
            // the client gives up
            while self.next().await?.is_some() {
                self.read_buf.discard_message();
            }
            return Ok(());
        }

        if let Some((_, password)) = &options.scram {
            if !self.scram(password).await? {
                return Ok(());
            }
        }

        self.auth(auth::AUTH_OK, None)?;
        self.message(b'K')?.write_bytes(&[7; 32])?.end_message()?;
        self.message(b'S')?
            .write_string("suggested_pool_concurrency")?
            .write_len_prefixed(b"10")?
            .end_message()?;
        self.ready()?;
        self.flush().await?;

        while let Some(mtype) = self.next().await? {
            if self.skip_until_sync && mtype != b'S' {
                self.read_buf.discard_message();
                continue;
            }

            let outcome = match mtype {
                b'P' => self.parse().await?,
                b'D' => self.describe()?,
                b'E' => self.execute()?,
                b'O' => self.optimistic_execute().await?,
                b'Q' => self.script().await?,
                b'S' => {
                    self.read_buf.finish_message()?;
                    self.skip_until_sync = false;
                    self.ready()?;
                    Outcome::Continue
                }
                _ => Outcome::Close,
            };

            if let Outcome::Close = outcome {
                return Ok(());
            }
            self.flush().await?;
        }

        Ok(())
    }

    /// Returns `false` if the client gave up.
    async fn scram(&mut self, password: &str) -> PeerResult<bool> {
        let buf = self.message(b'R')?.write_i32(auth::AUTH_SASL)?.write_i32(1)?;
        buf.write_string("SCRAM-SHA-256")?.end_message()?;
        self.flush().await?;

        if self.next().await? != Some(b'p') {
            return Ok(false);
        }
        let _method = self.read_buf.read_string()?;
        let client_first = self.read_buf.read_string()?;
        self.read_buf.finish_message()?;

        let bare = client_first.strip_prefix("n,,").ok_or("invalid gs2 header")?.to_owned();
        let client_nonce = bare.split_once(",r=").ok_or("missing nonce")?.1.to_owned();
        let server_nonce = format!("{client_nonce}{}", scram::generate_nonce());
        let server_first = format!("r={server_nonce},s={},i={SCRAM_ITERATIONS}", BASE64.encode(SCRAM_SALT));

        self.auth(auth::AUTH_SASL_CONTINUE, Some(&server_first))?;
        self.flush().await?;

        if self.next().await? != Some(b'r') {
            return Ok(false);
        }
        let _client_final = self.read_buf.read_string()?;
        self.read_buf.finish_message()?;

        // the proof is not verified, the client is expected to detect a mismatch
        let (_, signature) = scram::build_client_final_message(
            password,
            SCRAM_SALT,
            SCRAM_ITERATIONS,
            &bare,
            &server_first,
            &server_nonce,
        )?;
        self.auth(auth::AUTH_SASL_FINAL, Some(&format!("v={}", BASE64.encode(signature))))?;
        self.flush().await?;
        Ok(true)
    }

    fn lookup(&self, query: &str) -> Option<Reply> {
        self.shared.lock().unwrap().replies.get(query).cloned()
    }

    /// Apply the scripted failure of a query, returns the error code if it fails.
    fn take_failure(&self, query: &str) -> Option<u32> {
        let mut shared = self.shared.lock().unwrap();
        let reply = shared.replies.get_mut(query)?;
        match &mut reply.fail {
            Some((times, code)) if *times > 0 => {
                *times -= 1;
                Some(*code)
            }
            _ => None,
        }
    }

    /// Common handling of the first message of a query.
    async fn begin_query(&mut self, query: &str) -> PeerResult<Result<Reply, Outcome>> {
        let reply = self.lookup(query).unwrap_or_else(Reply::no_result);

        if let Some(delay) = reply.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(code) = self.take_failure(query) {
            self.fail_statement(code, "scripted failure")?;
            return Ok(Err(Outcome::Continue));
        }

        match &reply.kind {
            ReplyKind::Drop => Ok(Err(Outcome::Close)),
            ReplyKind::Error(code, message) => {
                let (code, message) = (*code, message.clone());
                self.fail_statement(code, &message)?;
                Ok(Err(Outcome::Continue))
            }
            _ => Ok(Ok(reply)),
        }
    }

    fn fail_statement(&mut self, code: u32, message: &str) -> Result<(), BufferError> {
        if self.status == b'T' {
            self.status = b'E';
        }
        self.skip_until_sync = true;
        self.error(code, message)
    }

    async fn parse(&mut self) -> PeerResult<Outcome> {
        let _headers = read_headers(&mut self.read_buf)?;
        let format = self.read_buf.read_char()?;
        let cardinality = self.read_buf.read_char()?;
        let _name = self.read_buf.read_string()?;
        let query = self.read_buf.read_string()?;
        self.read_buf.finish_message()?;

        *self.shared.lock().unwrap().parse_counts.entry(query.clone()).or_default() += 1;

        let reply = match self.begin_query(&query).await? {
            Ok(reply) => reply,
            Err(outcome) => return Ok(outcome),
        };

        let statement = Statement { query, format, cardinality, reply };
        let (in_id, out_id) = type_ids(&statement);
        let caps = statement.reply.capabilities.to_be_bytes();

        self.message(b'1')?
            .write_headers(&[(headers::CAPABILITIES, &caps[..])])?
            .write_char(result_cardinality(&statement))?
            .write_uuid(&in_id)?
            .write_uuid(&out_id)?
            .end_message()?;
        self.statement = Some(statement);
        Ok(Outcome::Continue)
    }

    fn describe(&mut self) -> PeerResult<Outcome> {
        self.read_buf.discard_message();
        let Some(statement) = &self.statement else {
            return Ok(Outcome::Close);
        };

        let (in_id, out_id) = type_ids(statement);
        let cardinality = result_cardinality(statement);
        let in_data = descriptor(in_id);
        let out_data = descriptor(out_id);

        self.message(b'T')?
            .write_headers(&[])?
            .write_char(cardinality)?
            .write_uuid(&in_id)?
            .write_len_prefixed(&in_data)?
            .write_uuid(&out_id)?
            .write_len_prefixed(&out_data)?
            .end_message()?;
        Ok(Outcome::Continue)
    }

    fn execute(&mut self) -> PeerResult<Outcome> {
        let _headers = read_headers(&mut self.read_buf)?;
        let _name = self.read_buf.read_string()?;
        let args = self.read_buf.consume_message()?;

        let Some(statement) = self.statement.take() else {
            return Ok(Outcome::Close);
        };
        self.run(&statement, args)?;
        self.statement = Some(statement);
        Ok(Outcome::Continue)
    }

    async fn optimistic_execute(&mut self) -> PeerResult<Outcome> {
        let _headers = read_headers(&mut self.read_buf)?;
        let format = self.read_buf.read_char()?;
        let cardinality = self.read_buf.read_char()?;
        let query = self.read_buf.read_string()?;
        let _in_id = self.read_buf.read_uuid()?;
        let _out_id = self.read_buf.read_uuid()?;
        let args = self.read_buf.consume_message()?;

        let reply = match self.begin_query(&query).await? {
            Ok(reply) => reply,
            Err(outcome) => return Ok(outcome),
        };

        let statement = Statement { query, format, cardinality, reply };
        self.run(&statement, args)?;
        self.statement = Some(statement);
        Ok(Outcome::Continue)
    }

    fn run(&mut self, statement: &Statement, args: Bytes) -> PeerResult {
        let rows = match &statement.reply.kind {
            ReplyKind::Rows(rows) => rows.clone(),
            ReplyKind::EchoStr => {
                let codec = self.codecs.build_codec(&descriptor(STR_TUPLE_ID))?;
                match codec.decode(args.slice(4..))? {
                    Value::Tuple(elements) => elements,
                    _ => vec![],
                }
            }
            ReplyKind::Increment => vec![Value::Int64(self.increment())],
            _ => vec![],
        };

        let (_, out_id) = type_ids(statement);
        if out_id != NULL_CODEC_ID {
            let rows = match (statement.format, statement.cardinality) {
                (b'j', b'm') => {
                    let array = rows.iter().map(to_json).collect::<Vec<_>>();
                    vec![Value::Str(serde_json::Value::Array(array).to_string())]
                }
                (b'j', _) => rows.iter().map(|v| Value::Str(to_json(v).to_string())).collect(),
                _ => rows,
            };

            let codec = ScalarCodec::base(out_id).ok_or("output is not a scalar")?;
            for row in &rows {
                let mut data = BytesMut::new();
                codec.encode(&mut data, row)?;
                self.message(b'D')?.write_u16(1)?.write_bytes(&data)?.end_message()?;
            }
        }

        self.complete()?;
        Ok(())
    }

    fn increment(&mut self) -> i64 {
        let mut shared = self.shared.lock().unwrap();
        match self.snapshot {
            Some((committed, _)) => {
                let value = self.written.or(committed).map_or(1, |v| v + 1);
                self.written = Some(value);
                value
            }
            None => {
                let value = shared.counter.map_or(1, |v| v + 1);
                shared.counter = Some(value);
                shared.version += 1;
                value
            }
        }
    }

    async fn script(&mut self) -> PeerResult<Outcome> {
        let fields = read_headers(&mut self.read_buf)?;
        let script = self.read_buf.read_string()?;
        self.read_buf.finish_message()?;
        self.shared.lock().unwrap().scripts.push(script.clone());

        let allowed = fields
            .get(&headers::ALLOW_CAPABILITIES)
            .and_then(|v| <[u8; 8]>::try_from(&v[..]).ok())
            .map(u64::from_be_bytes)
            .unwrap_or(capabilities::ALL);

        if let Some(code) = self.take_failure(&script) {
            self.error(code, "scripted failure")?;
            self.ready()?;
            return Ok(Outcome::Continue);
        }

        if let Some(reply) = self.lookup(&script) {
            if let Some(delay) = reply.delay {
                tokio::time::sleep(delay).await;
            }
            match reply.kind {
                ReplyKind::Drop => return Ok(Outcome::Close),
                ReplyKind::Error(code, message) => {
                    self.fail_statement(code, &message)?;
                    self.skip_until_sync = false;
                    self.ready()?;
                    return Ok(Outcome::Continue);
                }
                _ => {}
            }
        }

        let is_transaction_control = ["START TRANSACTION", "COMMIT", "ROLLBACK"]
            .iter()
            .any(|cmd| script.starts_with(cmd));

        if is_transaction_control && allowed & capabilities::TRANSACTION == 0 {
            self.error(CAPABILITY_ERROR, "cannot execute transaction control commands")?;
        } else if script.starts_with("START TRANSACTION") {
            let shared = self.shared.lock().unwrap();
            self.snapshot = Some((shared.counter, shared.version));
            drop(shared);
            self.written = None;
            self.status = b'T';
            self.complete()?;
        } else if script.starts_with("COMMIT") {
            let conflict = self.commit();
            self.snapshot = None;
            self.written = None;
            match conflict {
                true => {
                    self.status = b'E';
                    self.error(SERIALIZATION_ERROR, "could not serialize access due to concurrent update")?;
                }
                false => {
                    self.status = b'I';
                    self.complete()?;
                }
            }
        } else if script.starts_with("ROLLBACK") {
            self.snapshot = None;
            self.written = None;
            self.status = b'I';
            self.complete()?;
        } else {
            self.complete()?;
        }

        self.ready()?;
        Ok(Outcome::Continue)
    }

    /// Returns `true` on serialization conflict.
    fn commit(&mut self) -> bool {
        let mut shared = self.shared.lock().unwrap();
        let (Some((_, version)), Some(value)) = (self.snapshot, self.written) else {
            return false;
        };
        if shared.version != version {
            return true;
        }
        shared.counter = Some(value);
        shared.version += 1;
        false
    }
}

fn type_ids(statement: &Statement) -> (Uuid, Uuid) {
    let in_id = match statement.reply.kind {
        ReplyKind::EchoStr => STR_TUPLE_ID,
        _ => EMPTY_TUPLE_CODEC_ID,
    };
    let out_id = match &statement.reply.kind {
        _ if statement.format == b'j' && !matches!(statement.reply.kind, ReplyKind::NoResult) => STR_ID,
        ReplyKind::Rows(rows) => match rows.first() {
            Some(Value::Int64(_)) => INT64_ID,
            Some(Value::Bool(_)) => BOOL_ID,
            _ => STR_ID,
        },
        ReplyKind::EchoStr => STR_ID,
        ReplyKind::Increment => INT64_ID,
        _ => NULL_CODEC_ID,
    };
    (in_id, out_id)
}

fn result_cardinality(statement: &Statement) -> u8 {
    match statement.reply.kind {
        ReplyKind::NoResult => b'n',
        _ if statement.cardinality == b'o' => b'o',
        _ => b'm',
    }
}

fn descriptor(id: Uuid) -> Vec<u8> {
    let mut data = vec![];
    if id == STR_TUPLE_ID {
        data.push(2);
        data.extend_from_slice(STR_ID.as_bytes());
        data.push(4);
        data.extend_from_slice(STR_TUPLE_ID.as_bytes());
        data.extend_from_slice(&1u16.to_be_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());
    } else if id != NULL_CODEC_ID && id != EMPTY_TUPLE_CODEC_ID {
        data.push(2);
        data.extend_from_slice(id.as_bytes());
    }
    data
}

fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Str(s) => s.as_str().into(),
        Value::Int64(n) => (*n).into(),
        Value::Bool(b) => (*b).into(),
        _ => serde_json::Value::Null,
    }
}
