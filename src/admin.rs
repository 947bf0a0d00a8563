//! HTTP control API
//!
//! Thin surface over the fleet supervisor: host status, start/stop, service
//! listings and option updates. Optionally guarded by a bearer token.

use crate::messages::HostOptionUpdate;
use crate::supervisor::FleetSupervisor;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Control API server
pub struct AdminServer {
    bind_addr: SocketAddr,
    supervisor: Arc<FleetSupervisor>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Option<Arc<String>>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        supervisor: Arc<FleetSupervisor>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: Option<String>,
    ) -> Self {
        Self {
            bind_addr,
            supervisor,
            shutdown_rx,
            auth_token: auth_token.map(Arc::new),
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, auth = self.auth_token.is_some(), "Control API listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let supervisor = Arc::clone(&self.supervisor);
                            let auth_token = self.auth_token.clone();

                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let supervisor = Arc::clone(&supervisor);
                                    let token = auth_token.clone();
                                    async move { handle_request(req, supervisor, token).await }
                                });

                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Control API connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept control API connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Control API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

fn check_auth(req: &Request<hyper::body::Incoming>, expected: Option<&str>) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth).eq(expected))
        .unwrap_or(false)
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    supervisor: Arc<FleetSupervisor>,
    auth_token: Option<Arc<String>>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().trim_end_matches('/').to_string();
    let method = req.method().clone();

    debug!(%method, %path, "Control API request");

    // Liveness and version are open; everything else honors the token
    match (&method, path.as_str()) {
        (&Method::GET, "/health") => return Ok(response(StatusCode::OK, "ok")),
        (&Method::GET, "/version") => {
            let body = serde_json::json!({ "name": PKG_NAME, "version": VERSION });
            return Ok(json_response(StatusCode::OK, body.to_string()));
        }
        _ => {}
    }

    if !check_auth(&req, auth_token.as_deref().map(String::as_str)) {
        warn!(%path, "Unauthorized control API request");
        return Ok(response(StatusCode::UNAUTHORIZED, "unauthorized"));
    }

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let response = match (&method, segments.as_slice()) {
        (&Method::GET, ["hosts"]) => {
            let hosts = supervisor.list_hosts().await;
            let body = serde_json::json!({ "hosts": hosts, "count": hosts.len() });
            json_response(StatusCode::OK, body.to_string())
        }

        (&Method::GET, ["hosts", name]) => match supervisor.host_status(name).await {
            Some(state) => {
                let body = serde_json::json!({
                    "name": name,
                    "state": state,
                    "started": state.is_started(),
                });
                json_response(StatusCode::OK, body.to_string())
            }
            None => response(StatusCode::NOT_FOUND, "unknown host"),
        },

        (&Method::POST, ["hosts", name, "start"]) => match supervisor.start_host(name).await {
            Some(started) => {
                let body = serde_json::json!({ "started": started });
                json_response(StatusCode::OK, body.to_string())
            }
            None => response(StatusCode::NOT_FOUND, "unknown host"),
        },

        (&Method::POST, ["hosts", name, "stop"]) => match supervisor.stop_host(name).await {
            Some(Ok(())) => {
                let body = serde_json::json!({ "stopped": true });
                json_response(StatusCode::OK, body.to_string())
            }
            Some(Err(e)) => {
                let body = serde_json::json!({ "stopped": false, "error": e.to_string() });
                json_response(StatusCode::BAD_GATEWAY, body.to_string())
            }
            None => response(StatusCode::NOT_FOUND, "unknown host"),
        },

        (&Method::GET, ["hosts", name, "services"]) => {
            match supervisor.list_services(name).await {
                Some(services) => {
                    let body = serde_json::json!({
                        "services": services,
                        "count": services.len(),
                    });
                    json_response(StatusCode::OK, body.to_string())
                }
                None => response(StatusCode::NOT_FOUND, "unknown host"),
            }
        }

        (&Method::POST, ["hosts", name, "options"]) => {
            let name = name.to_string();
            let body = req.into_body().collect().await?.to_bytes();
            match parse_option_body(&body) {
                Ok(update) => match supervisor.update_option(&name, update).await {
                    Ok(true) => json_response(StatusCode::OK, r#"{"updated":true}"#),
                    Ok(false) => response(StatusCode::NOT_FOUND, "unknown host"),
                    Err(e) => {
                        error!(host = %name, error = %e, "Option update failed");
                        response(StatusCode::INTERNAL_SERVER_ERROR, "option update failed")
                    }
                },
                Err(reason) => response(StatusCode::BAD_REQUEST, reason),
            }
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

/// Parse `{"key": "...", "value": ...}` into an option update.
/// Values may arrive as their native JSON type or as strings.
fn parse_option_body(body: &[u8]) -> Result<HostOptionUpdate, String> {
    let json: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| format!("invalid JSON body: {}", e))?;
    let key = json
        .get("key")
        .and_then(|k| k.as_str())
        .ok_or("missing 'key'")?;
    let value = json.get("value").ok_or("missing 'value'")?;

    match key {
        "max_alive_time" => {
            let secs = value
                .as_u64()
                .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
                .ok_or("'max_alive_time' takes seconds as a non-negative integer")?;
            Ok(HostOptionUpdate::MaxAliveTime(secs))
        }
        "auto_stop" => {
            let enabled = value
                .as_bool()
                .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
                .ok_or("'auto_stop' takes a boolean")?;
            Ok(HostOptionUpdate::AutoStop(enabled))
        }
        other => Err(format!("unknown option key '{}'", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_max_alive_time() {
        let update = parse_option_body(br#"{"key":"max_alive_time","value":600}"#).unwrap();
        assert_eq!(update, HostOptionUpdate::MaxAliveTime(600));

        let update = parse_option_body(br#"{"key":"max_alive_time","value":"120"}"#).unwrap();
        assert_eq!(update, HostOptionUpdate::MaxAliveTime(120));
    }

    #[test]
    fn test_parse_auto_stop() {
        let update = parse_option_body(br#"{"key":"auto_stop","value":false}"#).unwrap();
        assert_eq!(update, HostOptionUpdate::AutoStop(false));

        let update = parse_option_body(br#"{"key":"auto_stop","value":"true"}"#).unwrap();
        assert_eq!(update, HostOptionUpdate::AutoStop(true));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(parse_option_body(b"not json").is_err());
        assert!(parse_option_body(br#"{"key":"auto_stop"}"#).is_err());
        assert!(parse_option_body(br#"{"key":"color","value":"red"}"#).is_err());
        assert!(parse_option_body(br#"{"key":"max_alive_time","value":-5}"#).is_err());
    }
}
