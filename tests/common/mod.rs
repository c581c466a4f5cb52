//! In-memory Miniserver used by the integration tests.
//!
//! The mock plays the server side of the websocket: it decrypts `enc`/`fenc`
//! commands and the key exchange, hands the plain command to a test supplied
//! handler and sends the scripted answer back as header and payload frames.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use miniserver_protocol::config::CommunicatorConfig;
use miniserver_protocol::core::event::Event;
use miniserver_protocol::core::header::{BinaryHeader, EventType};
use miniserver_protocol::error::{ProtocolError, Result};
use miniserver_protocol::protocol::crypto::{aes_decrypt, aes_encrypt_base64};
use miniserver_protocol::protocol::TokenRecord;
use miniserver_protocol::service::{Connection, ConnectionDelegate};
use miniserver_protocol::transport::{
    Connector, HttpChannel, HttpResponse, Transport, TransportEvent,
};
use miniserver_protocol::utils::throughput::DataProgress;
use rsa::pkcs8::EncodePublicKey;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

/// One-time salt handed out by the mock (hex)
pub const ONE_TIME_SALT: &str = "3132333435363738";

/// Something the mock sends back for a command
#[derive(Debug, Clone)]
pub enum ServerReply {
    /// `LL` answer; encrypted when the command came in as `fenc`
    Ll { code: u16, value: Value },
    /// `LL` answer carrying `unix` (used with 401s)
    LlWithUnix { code: u16, value: Value, unix: u64 },
    Keepalive,
    File(String),
    EventTable(EventType, Vec<u8>),
    /// A header whose payload never follows
    HeaderOnly(EventType, u32),
    Close { code: u16, reason: String },
    /// Hold back the following replies
    Delay(Duration),
}

impl ServerReply {
    pub fn ok(value: impl Into<Value>) -> Self {
        ServerReply::Ll {
            code: 200,
            value: value.into(),
        }
    }

    pub fn code(code: u16) -> Self {
        ServerReply::Ll {
            code,
            value: Value::String(String::new()),
        }
    }
}

type Handler = Box<dyn Fn(&str) -> Vec<ServerReply> + Send + Sync>;

#[derive(Default)]
struct Session {
    key: String,
    iv: String,
}

pub struct MockMiniserver {
    handler: Handler,
    version: String,
    private_key: RsaPrivateKey,
    session: Mutex<Option<Session>>,
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    /// Plain commands in the order they arrived
    pub commands: Mutex<Vec<String>>,
    pub connects: AtomicUsize,
    pub public_key_fetches: AtomicUsize,
    pub closes: Mutex<Vec<u16>>,
    public_key_delay: Mutex<Duration>,
}

fn private_key() -> RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("rsa key"))
        .clone()
}

fn answer_text(control: &str, code: u16, value: &Value, unix: Option<u64>) -> String {
    let mut ll = json!({ "control": control, "value": value, "Code": code.to_string() });
    if let Some(unix) = unix {
        ll["unix"] = json!(unix);
    }
    json!({ "LL": ll }).to_string()
}

fn header(event_type: EventType, len: usize) -> TransportEvent {
    let header = BinaryHeader::new(event_type, len as u32, false);
    TransportEvent::Binary(Bytes::copy_from_slice(&header.encode()))
}

impl MockMiniserver {
    pub fn new<F>(version: &str, handler: F) -> Arc<Self>
    where
        F: Fn(&str) -> Vec<ServerReply> + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Box::new(handler),
            version: version.to_string(),
            private_key: private_key(),
            session: Mutex::new(None),
            events: Mutex::new(None),
            commands: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            public_key_fetches: AtomicUsize::new(0),
            closes: Mutex::new(Vec::new()),
            public_key_delay: Mutex::new(Duration::ZERO),
        })
    }

    /// Answer `getPublicKey` only after `delay`
    pub fn delay_public_key(&self, delay: Duration) {
        *self.public_key_delay.lock().unwrap() = delay;
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// Commands starting with `prefix`
    pub fn commands_with(&self, prefix: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|cmd| cmd.starts_with(prefix))
            .collect()
    }

    pub fn public_key_pem(&self) -> String {
        let der = self
            .private_key
            .to_public_key()
            .to_public_key_der()
            .expect("public key der");
        format!(
            "-----BEGIN CERTIFICATE-----\n{}\n-----END CERTIFICATE-----",
            STANDARD.encode(der.as_bytes())
        )
    }

    /// Push an unsolicited event into the open socket
    pub fn push(&self, event: TransportEvent) {
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            let _ = events.send(event);
        }
    }

    pub fn push_event_table(&self, event_type: EventType, payload: Vec<u8>) {
        self.push(header(event_type, payload.len()));
        self.push(TransportEvent::Binary(Bytes::from(payload)));
    }

    fn session_keys(&self) -> Option<(String, String)> {
        self.session
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| (s.key.clone(), s.iv.clone()))
    }

    /// Plain command and whether the answer has to be encrypted
    fn unwrap_command(&self, wire: &str) -> (String, bool) {
        let (cipher, encrypted_answer) = if let Some(rest) = wire.strip_prefix("jdev/sys/fenc/") {
            (rest, true)
        } else if let Some(rest) = wire.strip_prefix("jdev/sys/enc/") {
            (rest, false)
        } else {
            return (wire.to_string(), false);
        };

        let (key, iv) = self.session_keys().expect("encrypted command before key exchange");
        let cipher = percent_encoding::percent_decode_str(cipher)
            .decode_utf8()
            .unwrap()
            .to_string();
        let plain = aes_decrypt(&cipher, &key, &iv).expect("decryptable command");

        let cmd = if let Some(rest) = plain.strip_prefix("salt/") {
            rest.split_once('/').unwrap().1.to_string()
        } else if let Some(rest) = plain.strip_prefix("nextSalt/") {
            let rest = rest.split_once('/').unwrap().1;
            rest.split_once('/').unwrap().1.to_string()
        } else {
            panic!("unexpected encrypted payload {plain}");
        };
        (cmd, encrypted_answer)
    }

    fn key_exchange(&self, cipher: &str) -> Vec<ServerReply> {
        let raw = STANDARD.decode(cipher).expect("base64 session key");
        let plain = self
            .private_key
            .decrypt(Pkcs1v15Encrypt, &raw)
            .expect("rsa decrypt");
        let plain = String::from_utf8(plain).unwrap();
        let (key, iv) = plain.split_once(':').expect("key:iv");
        let salt = aes_encrypt_base64(ONE_TIME_SALT, key, iv).unwrap();
        *self.session.lock().unwrap() = Some(Session {
            key: key.to_string(),
            iv: iv.to_string(),
        });
        vec![ServerReply::ok(salt)]
    }

    fn frames(&self, control: &str, reply: ServerReply, encrypt: bool) -> Vec<TransportEvent> {
        let text_frames = |text: String| {
            let text = if encrypt {
                let (key, iv) = self.session_keys().unwrap();
                aes_encrypt_base64(&text, &key, &iv).unwrap()
            } else {
                text
            };
            vec![header(EventType::Text, text.len()), TransportEvent::Text(text)]
        };

        match reply {
            ServerReply::Ll { code, value } => {
                text_frames(answer_text(control, code, &value, None))
            }
            ServerReply::LlWithUnix { code, value, unix } => {
                text_frames(answer_text(control, code, &value, Some(unix)))
            }
            ServerReply::Keepalive => vec![header(EventType::Keepalive, 0)],
            ServerReply::File(text) => vec![
                header(EventType::File, text.len()),
                TransportEvent::Text(text),
            ],
            ServerReply::EventTable(event_type, payload) => vec![
                header(event_type, payload.len()),
                TransportEvent::Binary(Bytes::from(payload)),
            ],
            ServerReply::HeaderOnly(event_type, len) => vec![header(event_type, len as usize)],
            ServerReply::Close { code, reason } => vec![TransportEvent::Closed {
                code: Some(code),
                reason,
            }],
            ServerReply::Delay(_) => Vec::new(),
        }
    }

    fn answer(self: &Arc<Self>, wire: &str) {
        let (cmd, encrypt) = self.unwrap_command(wire);
        self.commands.lock().unwrap().push(cmd.clone());

        let replies = match cmd.strip_prefix("jdev/sys/keyexchange/") {
            Some(cipher) => self.key_exchange(cipher),
            None => (self.handler)(&cmd),
        };
        let Some(events) = self.events.lock().unwrap().clone() else {
            return;
        };

        let delayed = replies.iter().any(|r| matches!(r, ServerReply::Delay(_)));
        if !delayed {
            for reply in replies {
                for frame in self.frames(&cmd, reply, encrypt) {
                    let _ = events.send(frame);
                }
            }
            return;
        }

        let server = Arc::clone(self);
        tokio::spawn(async move {
            for reply in replies {
                if let ServerReply::Delay(delay) = reply {
                    tokio::time::sleep(delay).await;
                    continue;
                }
                for frame in server.frames(&cmd, reply, encrypt) {
                    let _ = events.send(frame);
                }
            }
        });
    }
}

struct MockTransport {
    server: Arc<MockMiniserver>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_text(&mut self, text: &str) -> Result<()> {
        self.server.answer(text);
        Ok(())
    }

    async fn close(&mut self, code: u16) {
        self.server.closes.lock().unwrap().push(code);
        self.server.events.lock().unwrap().take();
    }
}

/// Connector handing out sockets to one mock server
pub struct MockConnector(pub Arc<MockMiniserver>);

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        url: &Url,
        subprotocol: &str,
    ) -> Result<(Box<dyn Transport>, mpsc::UnboundedReceiver<TransportEvent>)> {
        assert_eq!(subprotocol, "remotecontrol");
        assert!(url.as_str().ends_with("/ws/rfc6455"), "{url}");
        self.0.connects.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::unbounded_channel();
        *self.0.events.lock().unwrap() = Some(tx);
        *self.0.session.lock().unwrap() = None;
        Ok((
            Box::new(MockTransport {
                server: Arc::clone(&self.0),
            }),
            rx,
        ))
    }
}

impl MockMiniserver {
    fn http_answer(&self, url: &Url) -> Result<HttpResponse> {
        let path = url.path();
        let body = if path.ends_with("jdev/cfg/apiKey") {
            let value = format!(
                concat!(
                    "{{'snr': '50:4F:94:10:B8:4A', 'version':'{}', ",
                    "'key': '', 'local': true, 'httpsStatus': 0}}"
                ),
                self.version
            );
            json!({ "LL": { "control": "dev/cfg/apiKey", "value": value, "Code": "200" } })
        } else if path.ends_with("jdev/sys/getPublicKey") {
            self.public_key_fetches.fetch_add(1, Ordering::SeqCst);
            json!({
                "LL": {
                    "control": "dev/sys/getPublicKey",
                    "value": self.public_key_pem(),
                    "Code": "200",
                }
            })
        } else {
            return Err(ProtocolError::Http(format!("unexpected url {url}")));
        };

        Ok(HttpResponse {
            final_url: url.clone(),
            body,
        })
    }
}

/// HTTP side of the mock, sharing the server
pub struct MockHttp(pub Arc<MockMiniserver>);

#[async_trait]
impl HttpChannel for MockHttp {
    async fn get_json(&self, url: &Url) -> Result<HttpResponse> {
        let delay = *self.0.public_key_delay.lock().unwrap();
        if url.path().ends_with("jdev/sys/getPublicKey") && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.0.http_answer(url)
    }
}

/// Delegate recording every notification
#[derive(Default)]
pub struct RecordingDelegate {
    pub confirmed: Mutex<Vec<TokenRecord>>,
    pub received: Mutex<Vec<TokenRecord>>,
    pub refreshed: Mutex<Vec<TokenRecord>>,
    pub invalid: AtomicUsize,
    pub closed: Mutex<Vec<ProtocolError>>,
    pub events: Mutex<Vec<(EventType, Vec<Event>)>>,
    pub progress: Mutex<Vec<Option<DataProgress>>>,
}

impl ConnectionDelegate for RecordingDelegate {
    fn token_confirmed(&self, record: &TokenRecord) {
        self.confirmed.lock().unwrap().push(record.clone());
    }

    fn token_received(&self, record: &TokenRecord) {
        self.received.lock().unwrap().push(record.clone());
    }

    fn token_refreshed(&self, record: &TokenRecord) {
        self.refreshed.lock().unwrap().push(record.clone());
    }

    fn token_invalid(&self) {
        self.invalid.fetch_add(1, Ordering::SeqCst);
    }

    fn connection_closed(&self, reason: &ProtocolError) {
        self.closed.lock().unwrap().push(reason.clone());
    }

    fn event_received(&self, events: &[Event], event_type: EventType) {
        self.events
            .lock()
            .unwrap()
            .push((event_type, events.to_vec()));
    }

    fn data_progress(&self, progress: Option<&DataProgress>) {
        self.progress.lock().unwrap().push(progress.copied());
    }
}

/// Plain handler answering the commands every test needs
pub fn basic_reply(cmd: &str) -> Option<Vec<ServerReply>> {
    if cmd == "keepalive" {
        return Some(vec![ServerReply::Keepalive]);
    }
    if cmd == "jdev/sys/getkey" {
        return Some(vec![ServerReply::ok(ONE_TIME_SALT)]);
    }
    if cmd.starts_with("authenticate/") || cmd.starts_with("authenticateEnc/") {
        return Some(vec![ServerReply::ok("")]);
    }
    None
}

pub fn config(download: bool) -> CommunicatorConfig {
    CommunicatorConfig::default_with_overrides(|c| {
        c.socket.download = download;
    })
}

pub fn connect(
    server: &Arc<MockMiniserver>,
    config: CommunicatorConfig,
    delegate: Arc<RecordingDelegate>,
) -> Connection {
    Connection::builder(
        config,
        Arc::new(MockConnector(Arc::clone(server))),
        Arc::new(MockHttp(Arc::clone(server))),
    )
    .delegate(delegate)
    .build()
    .expect("valid config")
}

/// Let spawned tasks run without moving the paused clock far
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
