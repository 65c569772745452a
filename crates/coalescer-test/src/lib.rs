//! Helpers for testing the coalescer against a real HTTP transport.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using a [`Server`] or [`HitCounter`], make sure that it is held until all requests
//!    to it have been made. The server stops serving when dropped, and all connections to it
//!    will fail. To avoid this, assign it to a variable: `let server = HitCounter::new();`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{self, OriginalUri, Request};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::routing::{any, get};
use axum::{Json, Router};
use reqwest::Url;
use serde_json::{Map, Value, json};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `coalescer_service` crate and
///    mutes all other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("coalescer_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    pub fn with_router(router: Router) -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = std::net::TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Echoes the request as JSON.
///
/// The response contains the method, the path, the JSON body (or `null`) and all `x-` headers.
async fn echo(
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: String,
) -> Json<Value> {
    let body = serde_json::from_str::<Value>(&body).unwrap_or(Value::Null);
    let headers: Map<String, Value> = headers
        .iter()
        .filter(|(name, _)| name.as_str().starts_with("x-"))
        .filter_map(|(name, value)| {
            let value = value.to_str().ok()?;
            Some((name.to_string(), Value::String(value.into())))
        })
        .collect();

    Json(json!({
        "method": method.as_str(),
        "path": uri.path(),
        "body": body,
        "headers": headers,
    }))
}

/// A test server that counts the requests it receives.
///
/// It serves the following routes:
///
///  - `/echo/*path`: responds with a JSON description of the request, for any method.
///  - `/delay/:time/*path`: waits for the given humantime duration, then echoes the path.
///  - `/respond_statuscode/:num/*tail`: responds with an empty body and the given status.
///  - `/fail_times/:n/*tail`: responds with `503` to the first `n` hits of a URL, then with
///    the number of the attempt.
///  - `/garbage_data/*tail`: responds with the tail as plain text, which is not valid JSON.
///  - `/empty/*tail`: responds with an empty body.
pub struct HitCounter {
    server: Server,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl HitCounter {
    pub fn new() -> Self {
        let hits = Arc::new(Mutex::new(BTreeMap::new()));

        let hitcounter = {
            let hits = hits.clone();
            move |OriginalUri(uri): OriginalUri, req: Request, next: Next| {
                let hits = hits.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        let hits = hits.entry(uri.to_string()).or_default();
                        *hits += 1;
                    }

                    next.run(req).await
                }
            }
        };

        let failures: Arc<Mutex<BTreeMap<String, usize>>> = Default::default();

        let router = Router::new()
            .route("/echo", any(echo))
            .route("/echo/*path", any(echo))
            .route(
                "/delay/:time/*path",
                get(
                    |extract::Path((time, path)): extract::Path<(String, String)>| async move {
                        let duration = humantime::parse_duration(&time).unwrap();
                        tokio::time::sleep(duration).await;

                        Json(json!({ "path": path }))
                    },
                ),
            )
            .route(
                "/respond_statuscode/:num/*tail",
                get(
                    |extract::Path((num, _)): extract::Path<(u16, String)>| async move {
                        StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                    },
                ),
            )
            .route(
                "/fail_times/:n/*tail",
                get(
                    move |extract::Path((times, tail)): extract::Path<(usize, String)>| {
                        let failures = failures.clone();
                        async move {
                            let attempt = {
                                let mut failures = failures.lock().unwrap();
                                let attempt = failures.entry(tail).or_default();
                                *attempt += 1;
                                *attempt
                            };

                            if attempt <= times {
                                Err(StatusCode::SERVICE_UNAVAILABLE)
                            } else {
                                Ok(Json(json!({ "attempt": attempt })))
                            }
                        }
                    },
                ),
            )
            .route(
                "/garbage_data/*tail",
                get(|extract::Path(tail): extract::Path<String>| async move { tail }),
            )
            .route("/empty/*tail", get(|| async { StatusCode::OK }))
            .layer(middleware::from_fn(hitcounter));

        let server = Server::with_router(router);

        Self { server, hits }
    }

    /// Returns the number of hits since the last call, and resets the counter.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Returns the hits per URL since the last call, and resets the counter.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_iter().collect()
    }

    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }

    /// The base URL to resolve relative endpoints against.
    pub fn base_url(&self) -> Url {
        self.server.url("/")
    }
}

impl Default for HitCounter {
    fn default() -> Self {
        Self::new()
    }
}
