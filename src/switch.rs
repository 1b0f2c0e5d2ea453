//! Remote start/stop switch.
//!
//! The backend decides whether a rider's position should be reported right
//! now. `GET /api/rider/tracking` answers with a loosely shaped JSON payload;
//! the directive has been seen at three different paths:
//!
//! ```text
//! { "data": [ { "tracking": "start" } ] }
//! { "data": { "tracking": "start" } }
//! { "tracking": "start" }
//! ```
//!
//! [`parse_directive`] tries each shape in that order and takes the first
//! non-null value. Anything that is not `start`/`stop` (case-insensitive,
//! trimmed), or no value at all, reads as [`Directive::Stop`]. A malformed
//! payload never produces an error.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::backend::{BackendClient, BackendError};

/// The backend's current instruction for this rider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Directive {
    Start,
    #[default]
    Stop,
}

impl Directive {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
        }
    }

    #[must_use]
    pub fn is_start(self) -> bool {
        self == Self::Start
    }
}

type Extractor = fn(&Value) -> Option<&Value>;

fn first_data_row(v: &Value) -> Option<&Value> {
    v.get("data")?.get(0)?.get("tracking")
}

fn data_object(v: &Value) -> Option<&Value> {
    v.get("data")?.get("tracking")
}

fn top_level(v: &Value) -> Option<&Value> {
    v.get("tracking")
}

/// Known payload shapes, most specific first.
const EXTRACTORS: &[(&str, Extractor)] = &[
    ("data[0].tracking", first_data_row),
    ("data.tracking", data_object),
    ("tracking", top_level),
];

/// Normalize a tracking-status payload to a [`Directive`].
pub fn parse_directive(payload: &Value) -> Directive {
    let found = EXTRACTORS.iter().find_map(|(shape, extract)| {
        extract(payload)
            .filter(|v| !v.is_null())
            .map(|v| (*shape, v))
    });

    let Some((shape, raw)) = found else {
        debug!("Switch: no tracking field in payload, defaulting to stop");
        return Directive::Stop;
    };

    let text = match raw {
        Value::String(s) => s.trim().to_lowercase(),
        other => other.to_string().to_lowercase(),
    };
    match text.as_str() {
        "start" => Directive::Start,
        "stop" => Directive::Stop,
        _ => {
            debug!("Switch: unrecognized tracking value {raw} at {shape}, defaulting to stop");
            Directive::Stop
        }
    }
}

/// Anything that can answer "should this rider be tracked right now?".
#[async_trait]
pub trait DirectiveSource: Send + Sync {
    /// Fails only on transport or HTTP errors; shape problems yield `Stop`.
    async fn fetch_directive(&self, token: &str) -> Result<Directive, BackendError>;
}

#[async_trait]
impl DirectiveSource for BackendClient {
    async fn fetch_directive(&self, token: &str) -> Result<Directive, BackendError> {
        let payload = self.tracking_status(token).await?;
        Ok(parse_directive(&payload))
    }
}
