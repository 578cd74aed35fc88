//! Client for the remote tenant registry
//!
//! The registry is a PocketBase-style service: admins authenticate with
//! email/password for a bearer token, collections are paged over REST, and
//! changes are pushed over a server-sent event stream. A realtime connection
//! announces itself with a `PB_CONNECT` event carrying a client id, which is
//! then bound to collection topics with a POST to the same endpoint.

use crate::config::RegistryConfig;
use eventsource_stream::Eventsource;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::RwLock;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

const AUTH_PATH: &str = "/api/admins/auth-with-password";
const REALTIME_PATH: &str = "/api/realtime";
const CONNECT_EVENT: &str = "PB_CONNECT";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("registry returned {status} for {path}")]
    Status { status: u16, path: String },

    #[error("registry rejected credentials")]
    Unauthorized,

    #[error("realtime stream failed: {0}")]
    Stream(String),

    #[error("realtime stream closed before the connect handshake")]
    NoHandshake,

    #[error("malformed registry payload: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedAction {
    Create,
    Update,
    Delete,
    #[serde(other)]
    Unknown,
}

/// One change notification for a collection
#[derive(Debug, Clone, Deserialize)]
pub struct FeedEvent {
    pub action: FeedAction,
    #[serde(default)]
    pub record: serde_json::Value,
}

impl FeedEvent {
    pub fn parse(data: &str) -> Result<Self, RegistryError> {
        Ok(serde_json::from_str(data)?)
    }

    /// Identifier of the affected record, if the payload carries one
    pub fn record_id(&self) -> Option<&str> {
        self.record
            .get("id")
            .and_then(|id| id.as_str())
            .filter(|id| !id.is_empty())
    }
}

/// One page of a collection listing
#[derive(Debug, Deserialize)]
pub struct RecordPage {
    #[serde(default)]
    pub items: Vec<serde_json::Value>,
}

pub type FeedStream = BoxStream<'static, Result<FeedEvent, RegistryError>>;

/// Exponential backoff with full jitter
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            attempt: 0,
        }
    }

    /// Upper bound for the next delay, before jitter
    pub fn ceiling(&self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt.min(31)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Pick a random delay in `[0, ceiling]` and advance the exponent
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling();
        self.attempt = self.attempt.saturating_add(1);
        let millis = ceiling.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[derive(Serialize)]
struct Credentials<'a> {
    identity: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct AuthResponse {
    token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectPayload {
    client_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubscribeRequest<'a> {
    client_id: &'a str,
    subscriptions: Vec<String>,
}

pub struct RegistryClient {
    base_url: String,
    email: String,
    password: String,
    http: Client,
    token: RwLock<Option<String>>,
    backoff_initial: Duration,
    backoff_max: Duration,
    page_size: u32,
    debug: bool,
}

impl RegistryClient {
    pub fn new(config: &RegistryConfig) -> Result<Self, RegistryError> {
        let http = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            email: config.email.clone(),
            password: config.password.clone(),
            http,
            token: RwLock::new(None),
            backoff_initial: Duration::from_millis(config.backoff_initial_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
            page_size: config.page_size,
            debug: config.debug,
        })
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.backoff_initial, self.backoff_max)
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.read().is_some()
    }

    /// Drop the current token so the next call re-authenticates
    pub fn invalidate(&self) {
        *self.token.write() = None;
    }

    /// Exchange the configured credentials for a session token
    pub async fn authenticate(&self) -> Result<(), RegistryError> {
        let path = AUTH_PATH;
        let response = self
            .http
            .post(self.url(path))
            .timeout(REQUEST_TIMEOUT)
            .json(&Credentials {
                identity: &self.email,
                password: &self.password,
            })
            .send()
            .await?;

        let response = check_status(response, path)?;
        let auth: AuthResponse = response.json().await?;
        *self.token.write() = Some(auth.token);
        debug!(url = %self.base_url, "Registry client authenticated");
        Ok(())
    }

    /// Authenticate, retrying with backoff until it succeeds
    pub async fn authenticate_until_ok(&self) {
        let mut backoff = self.backoff();
        loop {
            match self.authenticate().await {
                Ok(()) => return,
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "Failed to authenticate registry client, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Fetch up to `page_size` records ordered by id, starting after the id `after`.
    ///
    /// Paging by id instead of by page number keeps deletes made between two
    /// calls from shifting live records past the cursor.
    pub async fn list_records(
        &self,
        collection: &str,
        after: Option<&str>,
    ) -> Result<Vec<serde_json::Value>, RegistryError> {
        let path = format!("/api/collections/{}/records", collection);
        let mut query = vec![
            ("page", "1".to_string()),
            ("perPage", self.page_size.to_string()),
            ("sort", "id".to_string()),
            ("skipTotal", "1".to_string()),
        ];
        if let Some(after) = after {
            query.push(("filter", format!("id>'{}'", escape_filter_value(after))));
        }

        let response = self
            .authorized(self.http.get(self.url(&path)))
            .timeout(REQUEST_TIMEOUT)
            .query(&query)
            .send()
            .await?;

        let response = check_status(response, &path)?;
        let page: RecordPage = response.json().await?;
        Ok(page.items)
    }

    /// Open a realtime connection subscribed to every record of `collection`.
    ///
    /// Events are buffered by the connection until the returned stream is polled.
    pub async fn open_feed(&self, collection: &str) -> Result<FeedStream, RegistryError> {
        let response = self
            .authorized(self.http.get(self.url(REALTIME_PATH)))
            .header("Accept", "text/event-stream")
            .send()
            .await?;
        let response = check_status(response, REALTIME_PATH)?;

        let mut events = Box::pin(response.bytes_stream().eventsource());

        let connect = loop {
            match events.next().await {
                Some(Ok(event)) if event.event == CONNECT_EVENT => break event,
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(RegistryError::Stream(e.to_string())),
                None => return Err(RegistryError::NoHandshake),
            }
        };
        let ConnectPayload { client_id } = serde_json::from_str(&connect.data)?;

        let topic = format!("{}/*", collection);
        let response = self
            .authorized(self.http.post(self.url(REALTIME_PATH)))
            .timeout(REQUEST_TIMEOUT)
            .json(&SubscribeRequest {
                client_id: &client_id,
                subscriptions: vec![topic.clone()],
            })
            .send()
            .await?;
        check_status(response, REALTIME_PATH)?;

        info!(collection, client_id = %client_id, "Subscribed to registry feed");

        let stream = events.filter_map(move |item| {
            let topic = topic.clone();
            async move {
                match item {
                    Ok(event) if event.event == topic => Some(FeedEvent::parse(&event.data)),
                    Ok(_) => None,
                    Err(e) => Some(Err(RegistryError::Stream(e.to_string()))),
                }
            }
        });

        Ok(stream.boxed())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token.read().as_deref() {
            Some(token) => request.header("Authorization", token),
            None => request,
        }
    }
}

fn escape_filter_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn check_status(response: reqwest::Response, path: &str) -> Result<reqwest::Response, RegistryError> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(RegistryError::Unauthorized);
    }
    if !status.is_success() {
        return Err(RegistryError::Status {
            status: status.as_u16(),
            path: path.to_string(),
        });
    }
    Ok(response)
}


/// In-process registry speaking just enough of the REST and realtime API for
/// the client and the mirrors to run against.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::collections::BTreeMap;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    pub const EMAIL: &str = "admin@example.com";
    pub const PASSWORD: &str = "hunter2";

    #[derive(Default)]
    struct State {
        records: Mutex<BTreeMap<String, BTreeMap<String, Value>>>,
        token: Mutex<String>,
        token_generation: AtomicUsize,
        logins: AtomicUsize,
        rejected_logins: AtomicUsize,
        connects: AtomicUsize,
        subscriptions: Mutex<Vec<String>>,
        feeds: Mutex<Vec<mpsc::UnboundedSender<Option<String>>>>,
        delete_after_list: Mutex<Option<(String, String)>>,
        push_on_list: Mutex<Option<(String, Value)>>,
    }

    impl State {
        fn push(&self, collection: &str, action: &str, record: Value) {
            let chunk = format!(
                "event: {}/*\ndata: {}\n\n",
                collection,
                json!({"action": action, "record": record})
            );
            self.feeds.lock().retain(|feed| feed.send(Some(chunk.clone())).is_ok());
        }
    }

    pub struct FakeRegistry {
        addr: SocketAddr,
        state: Arc<State>,
        server: JoinHandle<()>,
    }

    impl FakeRegistry {
        pub async fn start() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let state = Arc::new(State::default());
            *state.token.lock() = "token-0".to_string();

            let server = {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    while let Ok((stream, _)) = listener.accept().await {
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            let _ = serve(stream, state).await;
                        });
                    }
                })
            };

            Self { addr, state, server }
        }

        pub fn config(&self) -> RegistryConfig {
            RegistryConfig {
                url: format!("http://{}", self.addr),
                email: EMAIL.to_string(),
                password: PASSWORD.to_string(),
                backoff_initial_ms: 1,
                backoff_max_ms: 20,
                page_size: 2,
                ..Default::default()
            }
        }

        pub fn client(&self) -> RegistryClient {
            RegistryClient::new(&self.config()).unwrap()
        }

        pub fn insert(&self, collection: &str, record: Value) {
            let id = record["id"].as_str().unwrap().to_string();
            self.state
                .records
                .lock()
                .entry(collection.to_string())
                .or_default()
                .insert(id, record);
        }

        /// Login attempts, accepted or not
        pub fn logins(&self) -> usize {
            self.state.logins.load(Ordering::SeqCst)
        }

        pub fn reject_next_logins(&self, count: usize) {
            self.state.rejected_logins.store(count, Ordering::SeqCst);
        }

        /// Invalidate every issued token
        pub fn rotate_token(&self) {
            let generation = self.state.token_generation.fetch_add(1, Ordering::SeqCst) + 1;
            *self.state.token.lock() = format!("token-{}", generation);
        }

        /// Realtime connections opened so far
        pub fn connects(&self) -> usize {
            self.state.connects.load(Ordering::SeqCst)
        }

        pub fn subscriptions(&self) -> Vec<String> {
            self.state.subscriptions.lock().clone()
        }

        /// Delete a record right after the next listing is served
        pub fn delete_after_next_list(&self, collection: &str, id: &str) {
            *self.state.delete_after_list.lock() = Some((collection.to_string(), id.to_string()));
        }

        /// Push an update on the feeds while the next listing is being served
        pub fn update_during_next_list(&self, collection: &str, record: Value) {
            *self.state.push_on_list.lock() = Some((collection.to_string(), record));
        }

        pub fn push(&self, collection: &str, action: &str, record: Value) {
            self.state.push(collection, action, record);
        }

        /// End every open realtime stream
        pub fn drop_feeds(&self) {
            for feed in self.state.feeds.lock().drain(..) {
                let _ = feed.send(None);
            }
        }

        pub async fn wait_for_subscriptions(&self, count: usize) {
            for _ in 0..300 {
                if self.state.subscriptions.lock().len() >= count {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("expected {} subscriptions, saw {:?}", count, self.subscriptions());
        }
    }

    impl Drop for FakeRegistry {
        fn drop(&mut self) {
            self.server.abort();
            self.drop_feeds();
        }
    }

    struct FakeRequest {
        method: String,
        path: String,
        query: Vec<(String, String)>,
        authorization: Option<String>,
        body: Vec<u8>,
    }

    impl FakeRequest {
        fn param(&self, name: &str) -> Option<&str> {
            self.query
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str())
        }
    }

    async fn serve(mut stream: TcpStream, state: Arc<State>) -> std::io::Result<()> {
        let Some(request) = read_request(&mut stream).await? else {
            return Ok(());
        };
        let authorized = request.authorization.as_deref() == Some(state.token.lock().as_str());

        match (request.method.as_str(), request.path.as_str()) {
            ("POST", AUTH_PATH) => {
                state.logins.fetch_add(1, Ordering::SeqCst);
                let body: Value = serde_json::from_slice(&request.body).unwrap_or_default();
                let rejected = state
                    .rejected_logins
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if rejected || body["identity"] != EMAIL || body["password"] != PASSWORD {
                    return respond(&mut stream, 400, json!({"message": "Failed to authenticate."})).await;
                }
                let token = state.token.lock().clone();
                respond(&mut stream, 200, json!({"token": token})).await
            }
            _ if !authorized => respond(&mut stream, 401, json!({"message": "Unauthorized"})).await,
            ("GET", REALTIME_PATH) => stream_feed(stream, state).await,
            ("POST", REALTIME_PATH) => {
                let body: Value = serde_json::from_slice(&request.body).unwrap_or_default();
                if let Some(topics) = body["subscriptions"].as_array() {
                    let mut subscriptions = state.subscriptions.lock();
                    subscriptions.extend(topics.iter().filter_map(|t| t.as_str()).map(String::from));
                }
                respond(&mut stream, 200, json!({})).await
            }
            ("GET", path) if path.starts_with("/api/collections/") => {
                let collection = path
                    .trim_start_matches("/api/collections/")
                    .trim_end_matches("/records")
                    .to_string();
                list(&mut stream, &state, &collection, &request).await
            }
            _ => respond(&mut stream, 404, json!({"message": "Not found"})).await,
        }
    }

    async fn list(
        stream: &mut TcpStream,
        state: &State,
        collection: &str,
        request: &FakeRequest,
    ) -> std::io::Result<()> {
        if request.param("sort") != Some("id") {
            return respond(stream, 400, json!({"message": "unsorted listing"})).await;
        }
        let per_page: usize = request.param("perPage").and_then(|n| n.parse().ok()).unwrap_or(30);
        let after = request
            .param("filter")
            .and_then(|f| f.strip_prefix("id>'"))
            .and_then(|f| f.strip_suffix('\''))
            .map(String::from);

        if let Some((target, record)) = state.push_on_list.lock().take() {
            state.push(&target, "update", record);
        }

        let items: Vec<Value> = {
            let mut records = state.records.lock();
            let table = records.entry(collection.to_string()).or_default();
            let items = table
                .iter()
                .filter(|(id, _)| after.as_deref().map_or(true, |after| id.as_str() > after))
                .take(per_page)
                .map(|(_, record)| record.clone())
                .collect();

            let mut pending = state.delete_after_list.lock();
            if pending.as_ref().is_some_and(|(target, _)| target == collection) {
                if let Some((_, id)) = pending.take() {
                    table.remove(&id);
                }
            }
            items
        };

        respond(
            stream,
            200,
            json!({"page": 1, "perPage": per_page, "totalItems": -1, "totalPages": -1, "items": items}),
        )
        .await
    }

    async fn stream_feed(mut stream: TcpStream, state: Arc<State>) -> std::io::Result<()> {
        let n = state.connects.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.feeds.lock().push(tx);

        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n")
            .await?;
        let hello = format!(
            "id: {}\nevent: {}\ndata: {{\"clientId\":\"client-{}\"}}\n\n",
            n, CONNECT_EVENT, n
        );
        stream.write_all(hello.as_bytes()).await?;

        while let Some(Some(chunk)) = rx.recv().await {
            stream.write_all(chunk.as_bytes()).await?;
        }
        stream.shutdown().await
    }

    async fn respond(stream: &mut TcpStream, status: u16, body: Value) -> std::io::Result<()> {
        let reason = match status {
            200 => "OK",
            400 => "Bad Request",
            401 => "Unauthorized",
            _ => "Not Found",
        };
        let body = body.to_string();
        let response = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            reason,
            body.len(),
            body
        );
        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await
    }

    async fn read_request(stream: &mut TcpStream) -> std::io::Result<Option<FakeRequest>> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let head_end = loop {
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            buf.extend_from_slice(&chunk[..n]);
        };

        let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
        let mut lines = head.split("\r\n");
        let mut request_line = lines.next().unwrap_or_default().split_whitespace();
        let method = request_line.next().unwrap_or_default().to_string();
        let target = request_line.next().unwrap_or_default();
        let (path, query) = target.split_once('?').unwrap_or((target, ""));

        let mut authorization = None;
        let mut content_length = 0;
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                match name.trim().to_ascii_lowercase().as_str() {
                    "authorization" => authorization = Some(value.trim().to_string()),
                    "content-length" => content_length = value.trim().parse().unwrap_or(0),
                    _ => {}
                }
            }
        }

        let mut body = buf[head_end..].to_vec();
        while body.len() < content_length {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }

        Ok(Some(FakeRequest {
            method,
            path: path.to_string(),
            query: query
                .split('&')
                .filter(|pair| !pair.is_empty())
                .map(|pair| {
                    let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                    (decode_component(key), decode_component(value))
                })
                .collect(),
            authorization,
            body,
        }))
    }

    fn decode_component(raw: &str) -> String {
        let bytes = raw.as_bytes();
        let mut out = Vec::with_capacity(bytes.len());
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                b'+' => out.push(b' '),
                b'%' if i + 2 < bytes.len() => {
                    let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or("");
                    match u8::from_str_radix(hex, 16) {
                        Ok(byte) => {
                            out.push(byte);
                            i += 2;
                        }
                        Err(_) => out.push(b'%'),
                    }
                }
                other => out.push(other),
            }
            i += 1;
        }
        String::from_utf8_lossy(&out).to_string()
    }
}
