use std::{error::Error as StdError, sync::Arc};

use axum::{
    Router,
    extract::{
        Path, Query, State,
        rejection::{BytesRejection, PathRejection, QueryRejection},
    },
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;

use crate::{
    application::{
        content::{Color, ContentGenerator, ParseRequest},
        error::ComputationError,
    },
    cache::{ResponsePipeline, derive_key, derive_key_from_value, fallback_layer},
};

use super::middleware::{log_responses, set_request_context};

const JSON: &str = "application/json";
const JPEG: &str = "image/jpeg";
const HTML: &str = "text/html";
const JAVASCRIPT: &str = "application/javascript";
const CSS: &str = "text/css";
const SVG: &str = "image/svg+xml";

#[derive(Clone)]
pub struct HttpState {
    pub pipeline: ResponsePipeline,
    pub generator: Arc<dyn ContentGenerator>,
    pub default_color: Color,
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/parse", post(parse))
        .route("/thumbnail/{*file}", get(thumbnail))
        .route("/embed/{*id}", get(embed))
        .route("/assets/player.js", get(player_js))
        .route("/assets/player.svg", get(player_svg))
        .route("/assets/{file}", get(player_css))
        .fallback(nothing_produced)
        .with_state(state)
        .layer(middleware::from_fn(fallback_layer))
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

/// Empty answer for requests no handler claims; `fallback_layer` turns it
/// into the not-found response.
async fn nothing_produced() -> Response {
    Response::default()
}

/// Extractor failures answer like any other invalid input.
fn rejected(what: &str, rejection: &dyn StdError) -> Response {
    ComputationError::invalid_input(format!("{what} could not be read"))
        .with_cause(rejection)
        .into_response()
}

async fn parse(
    State(state): State<HttpState>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let body = match body {
        Ok(body) => body,
        Err(rejection) => return rejected("request body", &rejection),
    };
    let payload = match decode_body(&body) {
        Ok(payload) => payload,
        Err(err) => return err.into_response(),
    };
    let key = derive_key_from_value("parse", &payload);
    let request = match ParseRequest::from_value(payload) {
        Ok(request) => request,
        Err(err) => return err.into_response(),
    };

    let generator = Arc::clone(&state.generator);
    state
        .pipeline
        .cached(key, JSON, move || async move {
            let parsed = generator.parse(request).await?;
            serde_json::to_vec(&parsed).map(Bytes::from).map_err(|err| {
                ComputationError::generation("parse result could not be encoded").with_cause(&err)
            })
        })
        .await
        .into_response()
}

fn decode_body(body: &Bytes) -> Result<Value, ComputationError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_slice(body).map_err(|err| {
        ComputationError::invalid_input("request body is not valid JSON").with_cause(&err)
    })
}

async fn thumbnail(
    State(state): State<HttpState>,
    file: Result<Path<String>, PathRejection>,
) -> Response {
    let Path(file) = match file {
        Ok(file) => file,
        Err(rejection) => return rejected("thumbnail path", &rejection),
    };
    let Some(id) = file.strip_suffix(".jpg").filter(|id| !id.is_empty()) else {
        return nothing_produced().await;
    };
    let id = id.to_string();
    let key = match derive_key("thumbnail", &id) {
        Ok(key) => key,
        Err(err) => return err.into_response(),
    };

    let generator = Arc::clone(&state.generator);
    state
        .pipeline
        .cached(key, JPEG, move || async move { generator.thumbnail(&id).await })
        .await
        .into_response()
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EmbedQuery {
    color: Option<String>,
}

async fn embed(
    State(state): State<HttpState>,
    id: Result<Path<String>, PathRejection>,
    query: Result<Query<EmbedQuery>, QueryRejection>,
) -> Response {
    let Path(id) = match id {
        Ok(id) => id,
        Err(rejection) => return rejected("embed path", &rejection),
    };
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return rejected("query string", &rejection),
    };
    let color = match query.color.as_deref() {
        Some(raw) => match raw.parse::<Color>() {
            Ok(color) => color,
            Err(err) => return err.into_response(),
        },
        None => state.default_color.clone(),
    };
    let key = match derive_key("embed", &(id.as_str(), color.as_str())) {
        Ok(key) => key,
        Err(err) => return err.into_response(),
    };

    let generator = Arc::clone(&state.generator);
    state
        .pipeline
        .cached(key, HTML, move || async move {
            generator.embed(&id, &color).await.map(Bytes::from)
        })
        .await
        .into_response()
}

async fn player_js(State(state): State<HttpState>) -> Response {
    let key = match derive_key("player_js", &Value::Null) {
        Ok(key) => key,
        Err(err) => return err.into_response(),
    };

    let generator = Arc::clone(&state.generator);
    state
        .pipeline
        .cached(key, JAVASCRIPT, move || async move {
            generator.player_js().await.map(Bytes::from)
        })
        .await
        .into_response()
}

async fn player_css(
    State(state): State<HttpState>,
    file: Result<Path<String>, PathRejection>,
) -> Response {
    let Path(file) = match file {
        Ok(file) => file,
        Err(rejection) => return rejected("asset path", &rejection),
    };
    let Some(color) = stylesheet_color(&file) else {
        return nothing_produced().await;
    };
    let key = match derive_key("player_css", color.as_str()) {
        Ok(key) => key,
        Err(err) => return err.into_response(),
    };

    let generator = Arc::clone(&state.generator);
    state
        .pipeline
        .cached(key, CSS, move || async move {
            generator.player_css(&color).await.map(Bytes::from)
        })
        .await
        .into_response()
}

/// Color encoded in a `player-RRGGBB.css` file name.
fn stylesheet_color(file: &str) -> Option<Color> {
    let rgb = file.strip_prefix("player-")?.strip_suffix(".css")?;
    if rgb.starts_with('#') {
        return None;
    }
    rgb.parse().ok()
}

async fn player_svg(State(state): State<HttpState>) -> Response {
    let key = match derive_key("player_svg", &Value::Null) {
        Ok(key) => key,
        Err(err) => return err.into_response(),
    };

    let generator = Arc::clone(&state.generator);
    state
        .pipeline
        .cached(key, SVG, move || async move {
            generator.player_svg().await.map(Bytes::from)
        })
        .await
        .into_response()
}
