//! etcd v2 keys API client.
//!
//! Opens one HTTP/1 connection per request with hyper, bounded by the
//! configured connect and read timeouts. Endpoints are tried in order;
//! only transport failures move on to the next endpoint.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST, USER_AGENT};
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use crate::client::{CoordinationStore, DeleteOptions, GetOptions, PutOptions, Response};
use crate::error::{EtcdError, StoreError, StoreResult};

const KEYS_PREFIX: &str = "/v2/keys";

/// [`CoordinationStore`] backed by an etcd v2 cluster.
#[derive(Debug, Clone)]
pub struct HttpStore {
    endpoints: Vec<String>,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl HttpStore {
    /// `endpoints` are `host:port` pairs.
    pub fn new(endpoints: Vec<String>, connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            endpoints,
            connect_timeout,
            read_timeout,
        }
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    async fn send(
        &self,
        method: Method,
        key: &str,
        query: &[(&str, String)],
        form: Option<Vec<(&str, String)>>,
    ) -> StoreResult<Response> {
        let mut target = format!("{KEYS_PREFIX}{}", encode_path(key));
        if !query.is_empty() {
            target.push('?');
            target.push_str(&encode_form(query));
        }
        let body = form.map(|fields| encode_form(&fields));

        let mut last_error = StoreError::Io("no store endpoints configured".into());
        for endpoint in &self.endpoints {
            match self.send_to(endpoint, method.clone(), &target, body.clone()).await {
                Err(StoreError::Io(reason)) => {
                    warn!(%endpoint, %reason, "store endpoint unavailable");
                    last_error = StoreError::Io(reason);
                }
                result => return result,
            }
        }
        Err(last_error)
    }

    async fn send_to(
        &self,
        endpoint: &str,
        method: Method,
        target: &str,
        body: Option<String>,
    ) -> StoreResult<Response> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| StoreError::Io(format!("connect to {endpoint} timed out")))?
            .map_err(|e| StoreError::Io(format!("connect to {endpoint}: {e}")))?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| StoreError::Io(format!("handshake with {endpoint}: {e}")))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "store connection closed with error");
            }
        });

        let mut builder = http::Request::builder()
            .method(method.clone())
            .uri(target)
            .header(HOST, endpoint)
            .header(USER_AGENT, "keelson/0.1");
        let payload = match body {
            Some(form) => {
                builder = builder.header(CONTENT_TYPE, "application/x-www-form-urlencoded");
                Full::new(Bytes::from(form))
            }
            None => Full::new(Bytes::new()),
        };
        let request = builder
            .body(payload)
            .map_err(|e| StoreError::Io(format!("invalid request: {e}")))?;

        let exchange = async {
            let response = sender.send_request(request).await?;
            let status = response.status();
            let bytes = response.into_body().collect().await?.to_bytes();
            Ok::<_, hyper::Error>((status, bytes))
        };
        let (status, bytes) = tokio::time::timeout(self.read_timeout, exchange)
            .await
            .map_err(|_| StoreError::Io(format!("{method} {target} timed out")))?
            .map_err(|e| StoreError::Io(format!("{method} {target}: {e}")))?;

        trace!(%method, %target, %status, len = bytes.len(), "store response");
        decode(status, &bytes)
    }
}

/// Map an HTTP exchange to a response or a typed error.
fn decode(status: StatusCode, body: &[u8]) -> StoreResult<Response> {
    if status.is_success() {
        return serde_json::from_slice(body)
            .map_err(|e| StoreError::Io(format!("malformed store response: {e}")));
    }
    match serde_json::from_slice::<EtcdError>(body) {
        Ok(error) => Err(StoreError::Etcd(error)),
        Err(_) => Err(StoreError::Io(format!("unexpected store status {status}"))),
    }
}

/// Percent-encode each segment of a key path, keeping the separators.
fn encode_path(key: &str) -> String {
    let key = key.trim_start_matches('/');
    let mut path = String::with_capacity(key.len() + 1);
    for segment in key.split('/') {
        path.push('/');
        // byte_serialize uses the form encoding of spaces, which a path
        // would read as a literal '+'.
        for chunk in form_urlencoded::byte_serialize(segment.as_bytes()) {
            path.push_str(if chunk == "+" { "%20" } else { chunk });
        }
    }
    path
}

fn encode_form(fields: &[(&str, String)]) -> String {
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(fields)
        .finish()
}

#[async_trait]
impl CoordinationStore for HttpStore {
    async fn get(&self, key: &str, options: GetOptions) -> StoreResult<Response> {
        let mut query = Vec::new();
        if options.recursive {
            query.push(("recursive", "true".to_string()));
        }
        if options.sorted {
            query.push(("sorted", "true".to_string()));
        }
        self.send(Method::GET, key, &query, None).await
    }

    async fn put(&self, key: &str, value: Option<&str>, options: PutOptions) -> StoreResult<Response> {
        let mut form = Vec::new();
        if let Some(value) = value {
            form.push(("value", value.to_string()));
        }
        if let Some(ttl) = options.ttl {
            form.push(("ttl", ttl.to_string()));
        }
        if options.dir {
            form.push(("dir", "true".to_string()));
        }
        if let Some(prev_exist) = options.prev_exist {
            form.push(("prevExist", prev_exist.to_string()));
        }
        if let Some(prev_value) = options.prev_value {
            form.push(("prevValue", prev_value));
        }
        if let Some(prev_index) = options.prev_index {
            form.push(("prevIndex", prev_index.to_string()));
        }
        self.send(Method::PUT, key, &[], Some(form)).await
    }

    async fn post(&self, dir: &str, value: &str, ttl: Option<u64>) -> StoreResult<Response> {
        let mut form = vec![("value", value.to_string())];
        if let Some(ttl) = ttl {
            form.push(("ttl", ttl.to_string()));
        }
        self.send(Method::POST, dir, &[], Some(form)).await
    }

    async fn delete(&self, key: &str, options: DeleteOptions) -> StoreResult<Response> {
        let mut query = Vec::new();
        if options.recursive {
            query.push(("recursive", "true".to_string()));
        }
        if options.dir {
            query.push(("dir", "true".to_string()));
        }
        if let Some(prev_value) = options.prev_value {
            query.push(("prevValue", prev_value));
        }
        if let Some(prev_index) = options.prev_index {
            query.push(("prevIndex", prev_index.to_string()));
        }
        self.send(Method::DELETE, key, &query, None).await
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    /// Serve one canned HTTP response and hand back the raw request.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                request.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).to_string()
        });
        (addr, handle)
    }

    fn store(endpoints: Vec<String>) -> HttpStore {
        HttpStore::new(endpoints, Duration::from_secs(2), Duration::from_secs(2))
    }

    #[test]
    fn key_paths_keep_separators() {
        assert_eq!(encode_path("/discovery/announces"), "/discovery/announces");
        assert_eq!(encode_path("d/a b+c"), "/d/a%20b%2Bc");
    }

    #[test]
    fn form_body_encodes_json_values() {
        let form = encode_form(&[("value", r#"{"a":"b c"}"#.to_string()), ("ttl", "5".to_string())]);
        assert_eq!(form, "value=%7B%22a%22%3A%22b+c%22%7D&ttl=5");
    }

    #[test]
    fn decode_success_body() {
        let body = br#"{"action":"get","node":{"key":"/d","dir":true,"nodes":[{"key":"/d/1","value":"x","modifiedIndex":1,"createdIndex":1}]}}"#;
        let response = decode(StatusCode::OK, body).unwrap();
        assert_eq!(response.action, "get");
        assert_eq!(response.children().len(), 1);
    }

    #[test]
    fn decode_error_body() {
        let body = br#"{"errorCode":100,"message":"Key not found","cause":"/d","index":3}"#;
        let err = decode(StatusCode::NOT_FOUND, body).unwrap_err();
        assert!(err.is_key_not_found());
    }

    #[test]
    fn decode_garbage_is_io() {
        assert!(matches!(decode(StatusCode::OK, b"<html>"), Err(StoreError::Io(_))));
        assert!(matches!(
            decode(StatusCode::BAD_GATEWAY, b"bad gateway"),
            Err(StoreError::Io(_))
        ));
    }

    #[tokio::test]
    async fn get_against_fake_server() {
        let (addr, server) = serve_once(
            "200 OK",
            r#"{"action":"get","node":{"key":"/d/announces","dir":true,"nodes":[]}}"#,
        )
        .await;
        let response = store(vec![addr])
            .get("/d/announces", GetOptions::recursive_sorted())
            .await
            .unwrap();
        assert_eq!(response.node.unwrap().key, "/d/announces");

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /v2/keys/d/announces?recursive=true&sorted=true HTTP/1.1"));
    }

    #[tokio::test]
    async fn put_sends_form_and_maps_store_error() {
        let (addr, server) = serve_once(
            "404 Not Found",
            r#"{"errorCode":100,"message":"Key not found","cause":"/d/announces/7","index":9}"#,
        )
        .await;
        let err = store(vec![addr])
            .put(
                "/d/announces/7",
                Some("v"),
                PutOptions::default().with_ttl(5).with_prev_exist(true),
            )
            .await
            .unwrap_err();
        assert!(err.is_key_not_found());

        let request = server.await.unwrap();
        assert!(request.starts_with("PUT /v2/keys/d/announces/7 HTTP/1.1"));
        assert!(request.contains("value=v&ttl=5&prevExist=true"));
    }

    #[tokio::test]
    async fn unreachable_endpoints_are_io_errors() {
        let err = store(vec!["127.0.0.1:1".to_string()])
            .get("/d", GetOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));

        let err = store(Vec::new()).get("/d", GetOptions::default()).await.unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
    }

    #[tokio::test]
    async fn falls_over_to_next_endpoint() {
        let (addr, _server) = serve_once("200 OK", r#"{"action":"set"}"#).await;
        let response = store(vec!["127.0.0.1:1".to_string(), addr])
            .put("/d/k", Some("v"), PutOptions::default())
            .await
            .unwrap();
        assert_eq!(response.action, "set");
    }
}
