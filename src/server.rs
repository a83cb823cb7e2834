use std::{io, net::SocketAddr, sync::Arc};

use axum::{
    Router,
    extract::{ConnectInfo, Request, State},
    http::{HeaderValue, StatusCode, header, uri::PathAndQuery},
    response::{Html, IntoResponse, Response},
    routing,
};
use rearch::CapsuleHandle;
use thiserror::Error;
use tokio::{
    net::TcpListener,
    sync::{Mutex, oneshot, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::{error, info, instrument, warn};

use crate::{
    api,
    click_ledger::{ClickLedger, click_ledger_capsule},
    config::{Settings, settings_capsule},
    redirect::{
        ClientInfo, RedirectHandler, RedirectOutcome, RequestPath, redirect_handler_capsule,
    },
};

pub const NOT_FOUND_MESSAGE: &str = "Shortened URL not found";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("server terminated with an error: {0}")]
    Serve(#[from] io::Error),
    #[error("server task panicked or was cancelled: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Started(SocketAddr),
    AlreadyRunning(SocketAddr),
}

/// Shared references handed to every request.
#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub ledger: Arc<dyn ClickLedger>,
    pub redirect: Arc<RedirectHandler>,
}

pub fn app_state_capsule(CapsuleHandle { mut get, .. }: CapsuleHandle) -> AppState {
    AppState {
        settings: get.as_ref(settings_capsule).clone(),
        ledger: Arc::clone(get.as_ref(click_ledger_capsule)),
        redirect: Arc::clone(get.as_ref(redirect_handler_capsule)),
    }
}

struct RunningServer {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<io::Result<()>>,
}

/// Owns the listening socket; request handling lives in [`router`].
pub struct Server {
    app: Router,
    addr: String,
    running: Mutex<Option<RunningServer>>,
    state: Arc<watch::Sender<ServerState>>,
}

impl Server {
    #[must_use]
    pub fn new(app: Router, addr: impl Into<String>) -> Self {
        Self {
            app,
            addr: addr.into(),
            running: Mutex::new(None),
            state: Arc::new(watch::Sender::new(ServerState::Stopped)),
        }
    }

    /// Binds the listener and serves in a background task.
    ///
    /// # Errors
    /// Will return [`Err`] if the listener can't be bound.
    #[instrument(skip(self), fields(addr = %self.addr))]
    pub async fn start(&self) -> Result<StartOutcome, ServerError> {
        let mut running = self.running.lock().await;
        let exited = self.state() == ServerState::Stopped;
        if let Some(ended) = running.take_if(|server| exited || server.task.is_finished()) {
            match ended.task.await {
                Ok(Ok(())) => warn!(addr = %ended.local_addr, "Previous server exited on its own"),
                Ok(Err(err)) => error!(addr = %ended.local_addr, %err, "Previous server failed"),
                Err(err) => error!(addr = %ended.local_addr, %err, "Previous server task failed"),
            }
        }
        if let Some(server) = running.as_ref() {
            warn!(addr = %server.local_addr, "Server is already running");
            return Ok(StartOutcome::AlreadyRunning(server.local_addr));
        }

        self.state.send_replace(ServerState::Starting);
        let bound = match TcpListener::bind(&self.addr).await {
            Ok(listener) => listener.local_addr().map(|local_addr| (listener, local_addr)),
            Err(err) => Err(err),
        };
        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(source) => {
                self.state.send_replace(ServerState::Stopped);
                error!(%source, "Failed to start server");
                return Err(ServerError::Bind {
                    addr: self.addr.clone(),
                    source,
                });
            }
        };

        let (shutdown, shutdown_signal) = oneshot::channel::<()>();
        let app = self
            .app
            .clone()
            .into_make_service_with_connect_info::<SocketAddr>();
        self.state.send_replace(ServerState::Running);
        let state = Arc::clone(&self.state);
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    // NOTE: a dropped sender also shuts the server down
                    let _ = shutdown_signal.await;
                })
                .await;
            mark_exited(&state);
            result
        });

        *running = Some(RunningServer {
            local_addr,
            shutdown,
            task,
        });
        info!(%local_addr, "Server started");
        Ok(StartOutcome::Started(local_addr))
    }

    /// Stops accepting connections and waits for in-flight requests to drain.
    /// Returns `false` if the server wasn't running.
    ///
    /// # Errors
    /// Will return [`Err`] if the server task failed while serving.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<bool, ServerError> {
        let mut running = self.running.lock().await;
        let Some(RunningServer {
            local_addr,
            shutdown,
            task,
        }) = running.take()
        else {
            return Ok(false);
        };

        self.state.send_replace(ServerState::Stopping);
        info!(%local_addr, "Stopping server");
        let _ = shutdown.send(());
        let result = task.await;
        self.state.send_replace(ServerState::Stopped);
        info!(%local_addr, "Server stopped");

        result??;
        Ok(true)
    }

    #[must_use]
    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == ServerState::Running
    }

    /// Observes lifecycle transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }
}

/// A serve task that returns while still `Running` wasn't asked to stop.
fn mark_exited(state: &watch::Sender<ServerState>) {
    state.send_if_modified(|state| {
        let exited_unasked = *state == ServerState::Running;
        if exited_unasked {
            warn!("Server stopped without a stop request");
            *state = ServerState::Stopped;
        }
        exited_unasked
    });
}

/// Every GET is routed through [`RequestPath::parse`].
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", routing::get(serve_request))
        .route("/{*path}", routing::get(serve_request))
        .with_state(state)
}

#[instrument(skip_all, fields(uri = %request.uri()))]
async fn serve_request(State(state): State<AppState>, request: Request) -> Response {
    let accepted_at = Instant::now();
    let (parts, _) = request.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map_or("/", PathAndQuery::as_str);

    match RequestPath::parse(path_and_query) {
        RequestPath::Home => home_page(&state.settings).into_response(),
        RequestPath::Api(endpoint) => api::respond(endpoint, Arc::clone(&state.ledger)).await,
        RequestPath::Code(code) => {
            let client = ClientInfo {
                ip: parts
                    .extensions
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.ip()),
                user_agent: parts
                    .headers
                    .get(header::USER_AGENT)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or_default()
                    .to_owned(),
                accepted_at,
            };
            redirect_response(state.redirect.redirect(code, client).await)
        }
    }
}

fn redirect_response(outcome: RedirectOutcome) -> Response {
    match outcome {
        RedirectOutcome::Redirect { location } => match HeaderValue::from_str(&location) {
            Ok(location) => {
                (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, location)]).into_response()
            }
            Err(err) => {
                error!(location, %err, "Stored URL is not a valid Location header");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
            }
        },
        RedirectOutcome::NotFound => (StatusCode::NOT_FOUND, NOT_FOUND_MESSAGE).into_response(),
        RedirectOutcome::LookupFailed => {
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
        }
    }
}

fn home_page(settings: &Settings) -> Html<String> {
    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head><title>clicky-short</title></head>
<body>
  <h1>clicky-short</h1>
  <p>Server is running.</p>
  <dl>
    <dt>Status</dt><dd>Online</dd>
    <dt>Listening on</dt><dd>{addr}</dd>
    <dt>Short links</dt><dd>{base}/&lt;code&gt;</dd>
    <dt>Statistics</dt><dd><a href="/api/stats">/api/stats</a></dd>
  </dl>
</body>
</html>
"#,
        addr = settings.addr,
        base = settings.public_base_url,
    ))
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;

    use super::*;

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap_or_default();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[tokio::test]
    async fn test_redirect_response_is_permanent() {
        let response = redirect_response(RedirectOutcome::Redirect {
            location: "https://example.com/page".to_owned(),
        });
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.headers().get(header::LOCATION),
            Some(&HeaderValue::from_static("https://example.com/page"))
        );
    }

    #[tokio::test]
    async fn test_not_found_response_is_plain_text() {
        let response = redirect_response(RedirectOutcome::NotFound);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_text(response).await, NOT_FOUND_MESSAGE);
    }

    #[tokio::test]
    async fn test_invalid_location_is_a_server_error() {
        let response = redirect_response(RedirectOutcome::Redirect {
            location: "https://example.com/\nInjected: yes".to_owned(),
        });
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_lookup_failure_is_a_server_error() {
        let response = redirect_response(RedirectOutcome::LookupFailed);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_home_page_mentions_base_url() {
        let Html(page) = home_page(&Settings {
            public_base_url: "https://sho.rt".to_owned(),
            ..Settings::default()
        });
        assert!(page.contains("https://sho.rt/&lt;code&gt;"));
    }

    #[test]
    fn test_new_server_is_stopped() {
        let server = Server::new(Router::new(), "127.0.0.1:0");
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_serve_exiting_on_its_own_marks_stopped() {
        let server = Server::new(Router::new(), "127.0.0.1:0");
        let mut states = server.subscribe();
        let Ok(StartOutcome::Started(_)) = server.start().await else {
            panic!("server should have started");
        };

        // Signal the serve task directly, bypassing stop()
        let shutdown = {
            let mut running = server.running.lock().await;
            let (unused, _) = oneshot::channel();
            running
                .as_mut()
                .map(|server| std::mem::replace(&mut server.shutdown, unused))
        };
        assert!(shutdown.is_some_and(|shutdown| shutdown.send(()).is_ok()));

        let stopped = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            states.wait_for(|state| *state == ServerState::Stopped),
        )
        .await
        .is_ok_and(|waited| waited.is_ok());
        assert!(stopped);
        assert!(!server.is_running());

        let restarted = server.start().await;
        assert!(matches!(restarted, Ok(StartOutcome::Started(_))));
        assert!(server.is_running());
        assert!(server.stop().await.unwrap_or(false));
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_a_no_op() {
        let server = Server::new(Router::new(), "127.0.0.1:0");
        assert!(!server.stop().await.unwrap_or(true));
        assert_eq!(server.state(), ServerState::Stopped);
    }
}
