//! HTTP adapter forwarding content generation to the rendering service.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Method, RequestBuilder, Url};
use serde_json::Value;
use tracing::debug;

use crate::{
    application::{
        content::{Color, ContentGenerator, ParseRequest},
        error::ComputationError,
    },
    config::UpstreamSettings,
};

use super::error::InfraError;

#[derive(Clone, Debug)]
pub struct UpstreamGenerator {
    client: Client,
    base: Url,
}

impl UpstreamGenerator {
    pub fn new(settings: &UpstreamSettings) -> Result<Self, InfraError> {
        let base = settings
            .base_url
            .clone()
            .ok_or_else(|| InfraError::configuration("upstream.base_url is required to serve"))?;
        if base.cannot_be_a_base() {
            return Err(InfraError::configuration(format!(
                "upstream.base_url `{base}` cannot carry a path"
            )));
        }

        let client = Client::builder()
            .user_agent(Self::user_agent())
            .timeout(settings.timeout)
            .build()
            .map_err(|err| {
                InfraError::configuration(format!("failed to build upstream client: {err}"))
            })?;

        Ok(Self { client, base })
    }

    pub fn user_agent() -> &'static str {
        concat!("memoserve/", env!("CARGO_PKG_VERSION"))
    }

    /// `segments` appended to the base path, each percent-encoded on its own.
    fn url(&self, segments: &[&str], query: &[(&str, &str)]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in query {
                pairs.append_pair(name, value);
            }
        }
        url
    }

    async fn fetch(&self, request: RequestBuilder, what: &str) -> Result<Bytes, ComputationError> {
        let response = request.send().await.map_err(|err| {
            ComputationError::generation(format!("{what} request failed")).with_cause(&err)
        })?;

        let status = response.status();
        debug!(what, status = status.as_u16(), "upstream answered");
        if status.is_client_error() {
            let text = response.text().await.unwrap_or_default();
            let message = if text.trim().is_empty() {
                format!("{what} rejected with status {status}")
            } else {
                text
            };
            return Err(ComputationError::invalid_input(message));
        }
        if !status.is_success() {
            return Err(ComputationError::generation(format!(
                "{what} failed with status {status}"
            )));
        }

        response.bytes().await.map_err(|err| {
            ComputationError::generation(format!("{what} response could not be read"))
                .with_cause(&err)
        })
    }

    async fn fetch_text(
        &self,
        segments: &[&str],
        query: &[(&str, &str)],
        what: &str,
    ) -> Result<String, ComputationError> {
        let request = self
            .client
            .request(Method::GET, self.url(segments, query));
        let bytes = self.fetch(request, what).await?;
        String::from_utf8(bytes.to_vec()).map_err(|err| {
            ComputationError::generation(format!("{what} response is not UTF-8")).with_cause(&err)
        })
    }
}

#[async_trait]
impl ContentGenerator for UpstreamGenerator {
    async fn parse(&self, request: ParseRequest) -> Result<Value, ComputationError> {
        let builder = self
            .client
            .request(Method::POST, self.url(&["parse"], &[]))
            .json(&request);
        let bytes = self.fetch(builder, "parse").await?;
        serde_json::from_slice(&bytes).map_err(|err| {
            ComputationError::generation("parse response is not JSON").with_cause(&err)
        })
    }

    async fn thumbnail(&self, id: &str) -> Result<Bytes, ComputationError> {
        let file = format!("{id}.jpg");
        let request = self
            .client
            .request(Method::GET, self.url(&["thumbnail", file.as_str()], &[]));
        self.fetch(request, "thumbnail").await
    }

    async fn embed(&self, id: &str, color: &Color) -> Result<String, ComputationError> {
        self.fetch_text(&["embed", id], &[("color", color.as_str())], "embed")
            .await
    }

    async fn player_js(&self) -> Result<String, ComputationError> {
        self.fetch_text(&["assets", "player.js"], &[], "player script")
            .await
    }

    async fn player_css(&self, color: &Color) -> Result<String, ComputationError> {
        let file = format!("player-{color}.css");
        self.fetch_text(&["assets", file.as_str()], &[], "player stylesheet")
            .await
    }

    async fn player_svg(&self) -> Result<String, ComputationError> {
        self.fetch_text(&["assets", "player.svg"], &[], "player sprite")
            .await
    }
}
