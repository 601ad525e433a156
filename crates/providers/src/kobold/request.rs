//! Wire mapping shared by the blocking and async call paths.
//!
//! Nothing here performs I/O: the client sends what [`build_generate_body`]
//! returns and hands the raw response text to [`parse_generate_response`].

use crate::kobold::config::GenerationConfig;
use gen_core::llm::GenError;
use serde::Serialize;

pub const GENERATE_PATH: &str = "/api/v1/generate";
pub const EXTRA_VERSION_PATH: &str = "/api/extra/version";
pub const V1_VERSION_PATH: &str = "/api/v1/version";
pub const ABORT_PATH: &str = "/api/extra/abort";

/// Strips one trailing `/api`, or failing that one trailing `/`.
pub fn clean_url(url: &str) -> &str {
    if let Some(base) = url.strip_suffix("/api") {
        base
    } else if let Some(base) = url.strip_suffix('/') {
        base
    } else {
        url
    }
}

pub fn endpoint_url(endpoint: &str, path: &str) -> String {
    format!("{}{}", clean_url(endpoint), path)
}

#[derive(Debug, Serialize)]
struct GenerateBody<'a> {
    prompt: &'a str,
    #[serde(flatten)]
    config: &'a GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequence: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    genkey: Option<&'a str>,
}

/// Builds the `/api/v1/generate` payload. An empty stop list is left out.
pub fn build_generate_body(
    prompt: &str,
    config: &GenerationConfig,
    stop: Option<&[String]>,
    genkey: Option<&str>,
) -> Result<serde_json::Value, GenError> {
    let body = GenerateBody {
        prompt,
        config,
        stop_sequence: stop.filter(|s| !s.is_empty()),
        genkey,
    };
    serde_json::to_value(body).map_err(|e| GenError::Transport(format!("encode request: {}", e)))
}

/// Pulls `results[0].text` out of a generate response and applies the stop
/// sequences to it.
pub fn parse_generate_response(raw: &str, stop: Option<&[String]>) -> Result<String, GenError> {
    let malformed = || GenError::MalformedResponse {
        payload: raw.to_string(),
    };
    let v: serde_json::Value = serde_json::from_str(raw).map_err(|_| malformed())?;
    let text = v
        .get("results")
        .and_then(|r| r.get(0))
        .and_then(|r| r.get("text"))
        .and_then(serde_json::Value::as_str)
        .ok_or_else(malformed)?;
    Ok(strip_stop_sequence(text.trim(), stop.unwrap_or_default()).to_string())
}

/// Removes the first stop sequence, in list order, that `text` ends with.
/// At most one sequence is removed.
pub fn strip_stop_sequence<'a>(text: &'a str, stop: &[String]) -> &'a str {
    stop.iter()
        .filter(|s| !s.is_empty())
        .find_map(|s| text.strip_suffix(s.as_str()))
        .map(str::trim_end)
        .unwrap_or(text)
}

/// Reads the `version` field of an `/api/extra/version` reply.
///
/// Accepts a JSON number or a numeric string. Dotted release strings such as
/// `"1.45.2"` are read as their leading `major.minor`.
pub fn parse_extra_version(raw: &str) -> Option<f64> {
    let v: serde_json::Value = serde_json::from_str(raw).ok()?;
    match v.get("version")? {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => {
            let s = s.trim();
            s.parse::<f64>().ok().or_else(|| {
                let mut parts = s.splitn(3, '.');
                let major = parts.next()?;
                let minor = parts.next()?;
                format!("{}.{}", major, minor).parse::<f64>().ok()
            })
        }
        _ => None,
    }
}

/// The basic dialect only has to answer with some JSON.
pub fn is_json(raw: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(raw).is_ok()
}

/// `true` when an abort reply carries a truthy `success` field.
pub fn abort_succeeded(raw: &str) -> bool {
    let Ok(v) = serde_json::from_str::<serde_json::Value>(raw) else {
        return false;
    };
    match v.get("success") {
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(serde_json::Value::String(s)) => !s.is_empty(),
        Some(serde_json::Value::Array(a)) => !a.is_empty(),
        Some(serde_json::Value::Object(o)) => !o.is_empty(),
        Some(serde_json::Value::Null) | None => false,
    }
}
