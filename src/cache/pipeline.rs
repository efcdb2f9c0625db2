//! Memoized response pipeline.
//!
//! `cached` is the single entry point used by request handlers: it looks the
//! key up in the store, otherwise coalesces onto (or starts) the computation,
//! and writes fresh results back without making the caller wait for the write.
//! [`fallback_layer`] is the final dispatch step that turns a response without
//! a body into `404 Not found`.

use std::{future::Future, sync::Arc, time::Duration};

use axum::{
    body::{Body, HttpBody},
    http::{HeaderValue, Request, StatusCode, header::CONTENT_TYPE},
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use metrics::counter;
use tracing::{debug, instrument, warn};

use crate::application::error::{ComputationError, ErrorReport};

use super::{
    CacheConfig,
    coalescer::Coalescer,
    keys::CacheKey,
    store::{CacheStore, StoreError},
};

const SOURCE: &str = "cache::pipeline";

pub const NOT_FOUND_BODY: &str = "Not found";
pub const NOT_FOUND_CONTENT_TYPE: &str = "text/html";

/// A produced response body together with its content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Content {
    content_type: &'static str,
    body: Bytes,
}

impl Content {
    pub fn new(content_type: &'static str, body: Bytes) -> Self {
        Self { content_type, body }
    }

    pub fn content_type(&self) -> &'static str {
        self.content_type
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

impl IntoResponse for Content {
    fn into_response(self) -> Response {
        (
            StatusCode::OK,
            [(CONTENT_TYPE, HeaderValue::from_static(self.content_type))],
            self.body,
        )
            .into_response()
    }
}

/// Store handle, in-flight registry and cache policy shared by all handlers.
#[derive(Clone)]
pub struct ResponsePipeline {
    store: Arc<dyn CacheStore>,
    coalescer: Coalescer<Bytes>,
    config: CacheConfig,
}

impl ResponsePipeline {
    pub fn new(store: Arc<dyn CacheStore>, config: CacheConfig) -> Self {
        Self {
            store,
            coalescer: Coalescer::new(),
            config,
        }
    }

    pub fn coalescer(&self) -> &Coalescer<Bytes> {
        &self.coalescer
    }

    /// Serve `key` from the store, or resolve it at most once across all
    /// concurrent callers.
    ///
    /// Resolver errors are returned to every coalesced caller and are never
    /// written to the store.
    #[instrument(skip_all, fields(key = %key, content_type = content_type))]
    pub async fn cached<F, Fut>(
        &self,
        key: CacheKey,
        content_type: &'static str,
        resolver: F,
    ) -> Result<Content, ComputationError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Bytes, ComputationError>> + Send + 'static,
    {
        if let Some(body) = self.lookup(&key).await {
            counter!("memoserve_cache_hit_total").increment(1);
            debug!(cache = "pipeline", outcome = "hit", "serving cached content");
            return Ok(Content::new(content_type, body));
        }

        counter!("memoserve_cache_miss_total").increment(1);
        debug!(cache = "pipeline", outcome = "miss", "resolving content");

        let store = Arc::clone(&self.store);
        let ttl = self.config.ttl;
        let write_key = key.clone();
        let body = self
            .coalescer
            .register(key, move || async move {
                let body = resolver().await?;
                write_behind(store, write_key, body.clone(), ttl);
                Ok(body)
            })
            .await?;

        Ok(Content::new(content_type, body))
    }

    async fn lookup(&self, key: &CacheKey) -> Option<Bytes> {
        let budget = self.config.store_timeout;
        match tokio::time::timeout(budget, self.store.get(key)).await {
            Ok(Ok(Some(body))) if !body.is_empty() => Some(body),
            Ok(Ok(_)) => None,
            Ok(Err(err)) => {
                store_failed("get", key, &err);
                None
            }
            Err(_) => {
                store_failed("get", key, &StoreError::Timeout(budget));
                None
            }
        }
    }
}

fn write_behind(store: Arc<dyn CacheStore>, key: CacheKey, body: Bytes, ttl: Duration) {
    if body.is_empty() {
        return;
    }
    tokio::spawn(async move {
        if let Err(err) = store.set(&key, body, ttl).await {
            store_failed("set", &key, &err);
        }
    });
}

fn store_failed(op: &'static str, key: &CacheKey, err: &StoreError) {
    counter!("memoserve_cache_store_error_total", "op" => op).increment(1);
    warn!(
        target: "memoserve::cache::store",
        op,
        key = %key,
        error = %err,
        "cache store call failed; continuing without it"
    );
}

/// Response sent when nothing produced a body and no error occurred.
pub fn not_found_response() -> Response {
    let mut response = (
        StatusCode::NOT_FOUND,
        [(CONTENT_TYPE, HeaderValue::from_static(NOT_FOUND_CONTENT_TYPE))],
        NOT_FOUND_BODY,
    )
        .into_response();
    ErrorReport::from_message(SOURCE, StatusCode::NOT_FOUND, "no handler produced a body")
        .attach(&mut response);
    response
}

/// Outermost dispatch: responses with an empty body and no error report are
/// replaced by [`not_found_response`].
pub async fn fallback_layer(request: Request<Body>, next: Next) -> Response {
    let response = next.run(request).await;
    if produced_nothing(&response) {
        debug!(status = response.status().as_u16(), "no body produced, answering not found");
        not_found_response()
    } else {
        response
    }
}

fn produced_nothing(response: &Response) -> bool {
    response.extensions().get::<ErrorReport>().is_none()
        && response.body().size_hint().exact() == Some(0)
}

#[cfg(test)]
mod tests {
    use std::{
        num::NonZeroUsize,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;

    use super::*;
    use crate::{
        application::error::ErrorKind,
        cache::{keys::derive_key, store::MemoryStore},
    };

    #[derive(Default, Clone, Copy)]
    struct Faults {
        fail_get: bool,
        fail_set: bool,
        stall_get: bool,
    }

    struct FaultyStore {
        inner: MemoryStore,
        faults: Faults,
        sets: AtomicUsize,
    }

    impl FaultyStore {
        fn new(faults: Faults) -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryStore::new(NonZeroUsize::new(16).expect("non-zero")),
                faults,
                sets: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl CacheStore for FaultyStore {
        async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>, StoreError> {
            if self.faults.stall_get {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.faults.fail_get {
                return Err(StoreError::unavailable("connection refused"));
            }
            self.inner.get(key).await
        }

        async fn set(&self, key: &CacheKey, value: Bytes, ttl: Duration) -> Result<(), StoreError> {
            self.sets.fetch_add(1, Ordering::SeqCst);
            if self.faults.fail_set {
                return Err(StoreError::unavailable("connection reset"));
            }
            self.inner.set(key, value, ttl).await
        }
    }

    fn pipeline(store: Arc<FaultyStore>) -> ResponsePipeline {
        let config = CacheConfig {
            store_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        ResponsePipeline::new(store, config)
    }

    fn counting(
        calls: &Arc<AtomicUsize>,
        body: &'static str,
    ) -> impl FnOnce() -> futures::future::Ready<Result<Bytes, ComputationError>> + Send + 'static
    {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Ok(Bytes::from_static(body.as_bytes())))
        }
    }

    async fn wait_for_sets(store: &FaultyStore, expected: usize) {
        for _ in 0..1_000 {
            if store.sets.load(Ordering::SeqCst) >= expected {
                tokio::task::yield_now().await;
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("store never saw {expected} writes");
    }

    #[tokio::test]
    async fn second_call_is_served_from_store() {
        let store = FaultyStore::new(Faults::default());
        let pipeline = pipeline(Arc::clone(&store));
        let calls = Arc::new(AtomicUsize::new(0));
        let key = derive_key("player_js", &()).expect("key");

        let first = pipeline
            .cached(key.clone(), "application/javascript", counting(&calls, "js"))
            .await
            .expect("content");
        wait_for_sets(&store, 1).await;

        let second = pipeline
            .cached(key, "application/javascript", counting(&calls, "other"))
            .await
            .expect("content");

        assert_eq!(first, second);
        assert_eq!(second.body(), &Bytes::from_static(b"js"));
        assert_eq!(second.content_type(), "application/javascript");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_get_counts_as_miss() {
        let store = FaultyStore::new(Faults {
            fail_get: true,
            ..Default::default()
        });
        let pipeline = pipeline(Arc::clone(&store));
        let calls = Arc::new(AtomicUsize::new(0));
        let key = derive_key("thumbnail", "abc").expect("key");

        let content = pipeline
            .cached(key, "image/jpeg", counting(&calls, "jpeg"))
            .await
            .expect("content despite store failure");

        assert_eq!(content.body(), &Bytes::from_static(b"jpeg"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stalled_get_times_out_as_miss() {
        let store = FaultyStore::new(Faults {
            stall_get: true,
            ..Default::default()
        });
        let pipeline = pipeline(Arc::clone(&store));
        let calls = Arc::new(AtomicUsize::new(0));
        let key = derive_key("thumbnail", "slow").expect("key");

        let content = pipeline
            .cached(key, "image/jpeg", counting(&calls, "jpeg"))
            .await
            .expect("content despite slow store");

        assert_eq!(content.body(), &Bytes::from_static(b"jpeg"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_set_still_returns_content() {
        let store = FaultyStore::new(Faults {
            fail_set: true,
            ..Default::default()
        });
        let pipeline = pipeline(Arc::clone(&store));
        let calls = Arc::new(AtomicUsize::new(0));
        let key = derive_key("embed", &("abc", "50bf82")).expect("key");

        let content = pipeline
            .cached(key.clone(), "text/html", counting(&calls, "<iframe>"))
            .await
            .expect("content despite failed write");
        wait_for_sets(&store, 1).await;

        assert_eq!(content.body(), &Bytes::from_static(b"<iframe>"));
        assert_eq!(store.inner.get(&key).await.expect("get"), None);
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let store = FaultyStore::new(Faults::default());
        let pipeline = pipeline(Arc::clone(&store));
        let calls = Arc::new(AtomicUsize::new(0));
        let key = derive_key("parse", &serde_json::json!({"code": "???"})).expect("key");

        for attempt in 1..=2 {
            let counter = Arc::clone(&calls);
            let error = pipeline
                .cached(key.clone(), "application/json", move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ComputationError::invalid_input("bad input"))
                })
                .await
                .expect_err("resolver failure propagates");
            assert_eq!(error.kind(), ErrorKind::InvalidInput);
            assert_eq!(calls.load(Ordering::SeqCst), attempt);
            assert_eq!(store.sets.load(Ordering::SeqCst), 0);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn empty_results_are_not_written() {
        let store = FaultyStore::new(Faults::default());
        let pipeline = pipeline(Arc::clone(&store));
        let calls = Arc::new(AtomicUsize::new(0));
        let key = derive_key("player_svg", &()).expect("key");

        let content = pipeline
            .cached(key, "image/svg+xml", counting(&calls, ""))
            .await
            .expect("content");
        tokio::task::yield_now().await;

        assert!(content.body().is_empty());
        assert_eq!(store.sets.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn content_renders_ok_with_content_type() {
        let response = Content::new("text/css", Bytes::from_static(b"a{}")).into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).and_then(|v| v.to_str().ok()),
            Some("text/css")
        );
    }

    #[test]
    fn empty_response_without_report_produced_nothing() {
        assert!(produced_nothing(&StatusCode::OK.into_response()));
        assert!(!produced_nothing(
            &Content::new("text/css", Bytes::from_static(b"a{}")).into_response()
        ));
        assert!(!produced_nothing(
            &ComputationError::invalid_input("bad").into_response()
        ));
    }
}
