use anyhow::{bail, Context, Result};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};

use crate::error::UpgradeError;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Controller API over a websocket. Requests are sent one at a time; the
/// reply is matched by request id.
pub struct RpcClient {
    socket: Mutex<Socket>,
    next_id: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(rename = "request-id", default)]
    request_id: u64,
    #[serde(default)]
    error: Option<String>,
    #[serde(rename = "error-code", default)]
    error_code: Option<String>,
    #[serde(default)]
    response: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostPort {
    pub value: String,
    pub port: u16,
    #[serde(default)]
    pub scope: String,
}

/// What the controller says about itself on login.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoginResult {
    #[serde(rename = "server-version", default)]
    pub server_version: String,
    #[serde(rename = "controller-tag", default)]
    pub controller_tag: String,
    #[serde(default)]
    pub servers: Vec<Vec<HostPort>>,
    #[serde(rename = "discharge-required", default)]
    pub discharge_required: Option<Value>,
}

impl LoginResult {
    pub fn controller_uuid(&self) -> &str {
        self.controller_tag
            .strip_prefix("controller-")
            .unwrap_or(&self.controller_tag)
    }

    /// Every API address of every controller machine, `host:port`, in the
    /// order the controller listed them.
    pub fn api_addresses(&self) -> Vec<String> {
        let mut addrs: Vec<String> = Vec::new();
        for hp in self.servers.iter().flatten() {
            let addr = format!("{}:{}", hp.value, hp.port);
            if !addrs.contains(&addr) {
                addrs.push(addr);
            }
        }
        addrs
    }
}

impl RpcClient {
    /// Dial `wss://<addr>/api`, trusting only the controller's CA.
    pub async fn connect(addr: &str, ca_cert: &str) -> Result<Self> {
        let cert = native_tls::Certificate::from_pem(ca_cert.as_bytes())
            .context("parsing controller CA certificate")?;
        // Controller certificates are issued for "juju-apiserver", not for
        // the address we dial.
        let tls = native_tls::TlsConnector::builder()
            .add_root_certificate(cert)
            .danger_accept_invalid_hostnames(true)
            .build()
            .context("Failed to build TLS connector")?;

        let url = format!("wss://{}/api", addr);
        let (socket, _) = tokio_tungstenite::connect_async_tls_with_config(
            url.as_str(),
            None,
            false,
            Some(Connector::NativeTls(tls)),
        )
        .await
        .with_context(|| format!("dialing {}", url))?;

        Ok(Self {
            socket: Mutex::new(socket),
            next_id: AtomicU64::new(1),
        })
    }

    /// Password login as `tag` (`user-admin`).
    pub async fn login(&self, tag: &str, password: &str) -> Result<LoginResult> {
        let params = json!({
            "auth-tag": tag,
            "credentials": password,
            "nonce": "",
            "macaroons": [],
        });
        let response = self.call("Admin", 3, "Login", params).await?;
        let result: LoginResult = serde_json::from_value(response.clone()).map_err(|e| UpgradeError::Protocol {
            context: format!("decoding login response: {}", e),
            body: response.to_string(),
        })?;
        if result.discharge_required.is_some() {
            bail!("controller requires a macaroon discharge; log in with a password account");
        }
        Ok(result)
    }

    /// One request/response round trip. An error in the reply envelope is
    /// returned as a protocol error carrying the message.
    pub async fn call(&self, facade: &str, version: u32, request: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let message = json!({
            "request-id": id,
            "type": facade,
            "version": version,
            "request": request,
            "params": params,
        });
        tracing::debug!(facade = facade, request = request, id = id, "RPC call");

        let mut socket = self.socket.lock().await;
        socket
            .send(Message::Text(message.to_string()))
            .await
            .with_context(|| format!("sending {}.{}", facade, request))?;

        loop {
            let Some(frame) = socket.next().await else {
                bail!("connection closed waiting for {}.{}", facade, request);
            };
            let frame = frame.with_context(|| format!("reading {}.{} reply", facade, request))?;
            let text = match frame {
                Message::Text(text) => text,
                Message::Binary(data) => String::from_utf8_lossy(&data).into_owned(),
                Message::Close(_) => bail!("controller closed the connection during {}.{}", facade, request),
                _ => continue,
            };
            let reply: RpcResponse = serde_json::from_str(&text).map_err(|e| UpgradeError::Protocol {
                context: format!("decoding {}.{} reply: {}", facade, request, e),
                body: text.clone(),
            })?;
            if reply.request_id != id {
                tracing::debug!(expected = id, got = reply.request_id, "Ignoring unrelated reply");
                continue;
            }
            return reply_result(facade, request, reply);
        }
    }

    pub async fn close(&self) {
        let mut socket = self.socket.lock().await;
        if let Err(e) = socket.close(None).await {
            tracing::debug!("closing controller connection: {}", e);
        }
    }
}

fn reply_result(facade: &str, request: &str, reply: RpcResponse) -> Result<Value> {
    match reply.error {
        Some(message) if !message.is_empty() => {
            let body = match reply.error_code {
                Some(code) if !code.is_empty() => format!("{} ({})", message, code),
                _ => message,
            };
            Err(UpgradeError::Protocol {
                context: format!("{}.{}", facade, request),
                body,
            }
            .into())
        }
        _ => Ok(reply.response.unwrap_or(Value::Null)),
    }
}

/// Messages from an `ErrorResults` reply, skipping entries without an
/// error.
pub fn error_results(response: &Value) -> Vec<String> {
    response
        .get("results")
        .and_then(Value::as_array)
        .map(|results| {
            results
                .iter()
                .filter_map(|r| r.get("error"))
                .filter_map(|e| e.get("message").and_then(Value::as_str))
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
