//! Mapping of provider payloads onto [`GenerationResult`].
//!
//! Text comes back as a string, inline media as bytes with a content type,
//! and hosted media as an unfetched [`RemoteReference`]. A payload that fits
//! none of those is a [`NormalizationError`](crate::ErrorKind::NormalizationError),
//! never a best-effort guess.

use base64::Engine;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::types::{
    Content, ContentKind, GenerationResult, ProviderKind, ProviderMetadata, RawPayload,
    RawProviderResponse, RemoteReference, Usage,
};
use crate::Error;

/// Fields of a media job result that may carry the generated asset, in
/// order of preference.
const MEDIA_FIELDS: [(&str, ContentKind); 6] = [
    ("images", ContentKind::Image),
    ("image", ContentKind::Image),
    ("audio", ContentKind::Binary),
    ("audio_url", ContentKind::Binary),
    ("video", ContentKind::Binary),
    ("file", ContentKind::Binary),
];

/// Content extracted from a provider payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub kind: ContentKind,
    pub content: Content,
    pub usage: Option<Usage>,
}

/// Turn a raw provider response into the request's terminal result.
pub fn normalize(
    request_id: &str,
    kind: ProviderKind,
    raw: RawProviderResponse,
    mut metadata: ProviderMetadata,
) -> GenerationResult {
    if metadata.provider.is_empty() {
        metadata.provider = raw.provider.clone();
    }
    if metadata.provider_id.is_none() {
        metadata.provider_id = raw.provider_id.clone();
    }

    match normalize_content(kind, &raw) {
        Ok(normalized) => {
            if normalized.usage.is_some() {
                metadata.usage = normalized.usage;
            }
            GenerationResult::success(request_id, normalized.kind, normalized.content, metadata)
        }
        Err(e) => {
            tracing::warn!(
                request_id,
                provider = %raw.provider,
                error = %e,
                "could not normalize provider response"
            );
            GenerationResult::failure(request_id, &e, metadata)
        }
    }
}

/// Extract content from a raw response without building a result.
pub fn normalize_content(kind: ProviderKind, raw: &RawProviderResponse) -> Result<Normalized, Error> {
    match &raw.payload {
        RawPayload::Bytes { data, content_type } => Ok(Normalized {
            kind: kind_for_mime(content_type, ContentKind::Binary),
            content: Content::Bytes {
                data: data.clone(),
                content_type: content_type.clone(),
            },
            usage: None,
        }),
        RawPayload::Json(body) => match kind {
            ProviderKind::TextCompletion => chat_completion(body),
            ProviderKind::MediaJob => media_output(body),
        },
    }
}

fn kind_for_mime(content_type: &str, fallback: ContentKind) -> ContentKind {
    if content_type.starts_with("image/") {
        ContentKind::Image
    } else if content_type.is_empty() {
        fallback
    } else {
        ContentKind::Binary
    }
}

fn chat_completion(body: &Value) -> Result<Normalized, Error> {
    let choice = body
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .ok_or_else(|| Error::normalization("completion has no choices"))?;

    let text = choice
        .pointer("/message/content")
        .or_else(|| choice.get("text"))
        .and_then(Value::as_str)
        .ok_or_else(|| Error::normalization("completion choice has no text content"))?;

    Ok(Normalized {
        kind: ContentKind::Text,
        content: Content::Text {
            text: text.to_string(),
        },
        usage: body.get("usage").map(chat_usage),
    })
}

fn chat_usage(usage: &Value) -> Usage {
    let count = |pointer: &str| {
        usage
            .pointer(pointer)
            .and_then(Value::as_u64)
            .map(|n| n.min(u32::MAX as u64) as u32)
    };
    Usage {
        input_tokens: count("/prompt_tokens").unwrap_or(0),
        output_tokens: count("/completion_tokens").unwrap_or(0),
        cached_tokens: count("/prompt_tokens_details/cached_tokens")
            .or_else(|| count("/prompt_cache_hit_tokens")),
    }
}

fn media_output(body: &Value) -> Result<Normalized, Error> {
    let (asset, fallback_kind) = MEDIA_FIELDS
        .iter()
        .find_map(|(field, kind)| {
            let value = body.get(*field)?;
            let asset = match value {
                Value::Array(items) => items.first()?,
                other => other,
            };
            Some((asset, *kind))
        })
        .ok_or_else(|| Error::normalization("media result carries no asset"))?;

    let (url, content_type, expires_at) = match asset {
        Value::String(url) => (url.as_str(), None, None),
        Value::Object(fields) => {
            let url = fields
                .get("url")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::normalization("media asset has no url"))?;
            let content_type = fields.get("content_type").and_then(Value::as_str);
            let expires_at = fields
                .get("expires_at")
                .or_else(|| body.get("expires_at"))
                .map(parse_expiry)
                .transpose()?;
            (url, content_type, expires_at)
        }
        other => {
            return Err(Error::normalization(format!(
                "unexpected media asset shape: {other}"
            )))
        }
    };

    if let Some(inline) = url.strip_prefix("data:") {
        let (mime, data) = decode_data_uri(inline)?;
        let content_type = content_type.map(str::to_string).unwrap_or(mime);
        return Ok(Normalized {
            kind: kind_for_mime(&content_type, fallback_kind),
            content: Content::Bytes { data, content_type },
            usage: None,
        });
    }

    if !(url.starts_with("https://") || url.starts_with("http://")) {
        return Err(Error::normalization(format!("unsupported media url '{url}'")));
    }

    Ok(Normalized {
        kind: content_type
            .map(|ct| kind_for_mime(ct, fallback_kind))
            .unwrap_or(fallback_kind),
        content: Content::Remote(RemoteReference {
            url: url.to_string(),
            content_type: content_type.map(str::to_string),
            expires_at,
        }),
        usage: None,
    })
}

fn parse_expiry(value: &Value) -> Result<DateTime<Utc>, Error> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| Error::normalization(format!("bad expiry '{s}': {e}"))),
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or_else(|| Error::normalization(format!("bad expiry timestamp {n}"))),
        other => Err(Error::normalization(format!("bad expiry {other}"))),
    }
}

/// Split `<mime>;base64,<data>` and decode the data.
fn decode_data_uri(inline: &str) -> Result<(String, Vec<u8>), Error> {
    let (header, data) = inline
        .split_once(',')
        .ok_or_else(|| Error::normalization("malformed data uri"))?;
    let mime = header
        .strip_suffix(";base64")
        .ok_or_else(|| Error::normalization("only base64 data uris are supported"))?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| Error::normalization(format!("invalid base64 in data uri: {e}")))?;
    Ok((mime.to_string(), bytes))
}
