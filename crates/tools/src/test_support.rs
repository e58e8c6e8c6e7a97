//! Local HTTP fixture for fetch and crawl tests.
//!
//! Pages are served from 127.0.0.1 under the hostname `fixture.test`. The
//! guard resolves that name to a public address and the client pins it to the
//! loopback listener, so the real SSRF check still runs.

use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::{Html, IntoResponse, Response};
use axum::Router;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cache::FetchCache;
use crate::fetch::{client_builder, Fetcher};
use crate::url_guard::{StaticResolver, UrlGuard};

pub const FIXTURE_HOST: &str = "fixture.test";

struct FixtureState {
    pages: HashMap<String, String>,
    hits: AtomicUsize,
    requested: Mutex<Vec<String>>,
    requested_uris: Mutex<Vec<String>>,
}

pub struct Fixture {
    pub addr: SocketAddr,
    state: Arc<FixtureState>,
}

async fn serve_page(State(state): State<Arc<FixtureState>>, uri: Uri) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    state.requested.lock().unwrap().push(uri.path().to_string());
    let full = uri.path_and_query().map_or_else(|| uri.path().to_string(), |pq| pq.to_string());
    state.requested_uris.lock().unwrap().push(full);
    if uri.path() == "/slow" {
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
    match state.pages.get(uri.path()) {
        Some(body) => Html(body.clone()).into_response(),
        None => (StatusCode::NOT_FOUND, "missing").into_response(),
    }
}

impl Fixture {
    pub async fn start(pages: &[(&str, &str)]) -> Self {
        let state = Arc::new(FixtureState {
            pages: pages
                .iter()
                .map(|(p, b)| (p.to_string(), b.to_string()))
                .collect(),
            hits: AtomicUsize::new(0),
            requested: Mutex::new(Vec::new()),
            requested_uris: Mutex::new(Vec::new()),
        });
        let app = Router::new().fallback(serve_page).with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}:{}{}", FIXTURE_HOST, self.addr.port(), path)
    }

    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }

    pub fn requested(&self) -> Vec<String> {
        self.state.requested.lock().unwrap().clone()
    }

    /// Paths with their query strings.
    pub fn requested_uris(&self) -> Vec<String> {
        self.state.requested_uris.lock().unwrap().clone()
    }

    pub fn guard(&self) -> UrlGuard {
        let resolver = StaticResolver::new()
            .with_host(FIXTURE_HOST, &["93.184.216.34".parse().unwrap()])
            .with_host("elsewhere.test", &["93.184.216.35".parse().unwrap()]);
        UrlGuard::new(Arc::new(resolver))
    }

    pub fn fetcher(&self, max_chars: usize) -> Fetcher {
        self.fetcher_with_timeout(Duration::from_secs(5), max_chars)
    }

    pub fn fetcher_with_timeout(&self, timeout: Duration, max_chars: usize) -> Fetcher {
        let client = client_builder(timeout)
            .resolve(FIXTURE_HOST, self.addr)
            .build()
            .unwrap();
        Fetcher::with_client(client, self.guard(), Arc::new(FetchCache::default()), max_chars)
    }
}
