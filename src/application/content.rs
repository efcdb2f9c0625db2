//! Content generation contract.
//!
//! The expensive work behind every memoized route is delegated to a
//! [`ContentGenerator`]. Implementations must be deterministic for a given
//! input: the pipeline caches whatever they return.

use std::{fmt, str::FromStr};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::ComputationError;

/// Body of a `POST /parse` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParseRequest {
    pub code: String,
    pub options: Map<String, Value>,
}

impl ParseRequest {
    /// Interpret a decoded request body; `null` fields fall back to defaults.
    pub fn from_value(body: Value) -> Result<Self, ComputationError> {
        let Value::Object(mut fields) = body else {
            return Err(ComputationError::invalid_input(
                "parse request body must be a JSON object",
            ));
        };

        let code = match fields.remove("code") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(code)) => code,
            Some(_) => {
                return Err(ComputationError::invalid_input(
                    "`code` must be a string",
                ));
            }
        };
        let options = match fields.remove("options") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(options)) => options,
            Some(_) => {
                return Err(ComputationError::invalid_input(
                    "`options` must be an object",
                ));
            }
        };

        Ok(Self { code, options })
    }
}

/// Player accent color as six lowercase hex digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Color(String);

impl Color {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Color {
    type Err = ComputationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim().trim_start_matches('#');
        if trimmed.len() == 6 && trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            Ok(Self(trimmed.to_ascii_lowercase()))
        } else {
            Err(ComputationError::invalid_input(format!(
                "`{value}` is not a six digit hex color"
            )))
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Producer of the content served by the memoized routes.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    /// Expand embed shortcodes found in `request.code`.
    async fn parse(&self, request: ParseRequest) -> Result<Value, ComputationError>;

    /// JPEG thumbnail for a video id.
    async fn thumbnail(&self, id: &str) -> Result<Bytes, ComputationError>;

    /// HTML player page for a video id.
    async fn embed(&self, id: &str, color: &Color) -> Result<String, ComputationError>;

    async fn player_js(&self) -> Result<String, ComputationError>;

    async fn player_css(&self, color: &Color) -> Result<String, ComputationError>;

    async fn player_svg(&self) -> Result<String, ComputationError>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::application::error::ErrorKind;

    #[test]
    fn parse_request_defaults_missing_fields() {
        let request = ParseRequest::from_value(json!({})).expect("valid body");
        assert_eq!(request, ParseRequest::default());

        let request =
            ParseRequest::from_value(json!({"code": null, "options": null})).expect("valid body");
        assert_eq!(request, ParseRequest::default());
    }

    #[test]
    fn parse_request_keeps_code_and_options() {
        let request = ParseRequest::from_value(json!({
            "code": "[vimeo 1234]",
            "options": {"color": "ff0000"},
            "ignored": true
        }))
        .expect("valid body");

        assert_eq!(request.code, "[vimeo 1234]");
        assert_eq!(request.options.get("color"), Some(&json!("ff0000")));
    }

    #[test]
    fn parse_request_rejects_wrong_shapes() {
        for body in [json!([]), json!({"code": 5}), json!({"options": "x"})] {
            let error = ParseRequest::from_value(body).expect_err("invalid body");
            assert_eq!(error.kind(), ErrorKind::InvalidInput);
        }
    }

    #[test]
    fn color_is_normalized() {
        let color: Color = "#50BF82".parse().expect("valid color");
        assert_eq!(color.as_str(), "50bf82");
    }

    #[test]
    fn color_rejects_non_hex() {
        for value in ["", "50bf8", "50bf821", "zzzzzz"] {
            assert!(value.parse::<Color>().is_err(), "{value} should be rejected");
        }
    }
}
