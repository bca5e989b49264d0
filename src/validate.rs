//! Validate model output and repair it through the model when it does not
//! parse.

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{HunterError, Result};
use crate::llm::Completion;
use crate::prompt::{Schema, Shape};
use crate::records::scrub_placeholders;

/// Every fenced block opened by `start` and closed by `end`, in order.
pub fn code_blocks<'a>(text: &'a str, start: &str, end: &str) -> Vec<&'a str> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(i) = rest.find(start) {
        let body = &rest[i + start.len()..];
        let Some(j) = body.find(end) else { break };
        blocks.push(&body[..j]);
        rest = &body[j + end.len()..];
    }
    blocks
}

/// The payload of a model reply: the first ```` ```json ```` block, else the
/// first bare fenced block (minus its language tag), else the whole text.
pub fn payload(text: &str) -> &str {
    if let Some(b) = code_blocks(text, "```json", "```").into_iter().next() {
        // ```jsonl leaves a trailing "l" tag on the first line.
        return b.strip_prefix('l').unwrap_or(b).trim();
    }
    if let Some(b) = code_blocks(text, "```", "```").into_iter().next() {
        let first_line_end = b.find('\n').unwrap_or(0);
        let tag = &b[..first_line_end];
        if tag.chars().all(|c| c.is_ascii_alphanumeric()) {
            return b[first_line_end..].trim();
        }
        return b.trim();
    }
    text.trim()
}

/// Parse `text` into records of the given shape. Each record must be an
/// object with a non-empty string `name`.
pub fn parse_records(text: &str, shape: Shape) -> std::result::Result<Vec<Value>, String> {
    let body = payload(text);
    if body.is_empty() {
        return Err("empty payload".into());
    }

    let records = match shape {
        Shape::Object => {
            let v: Value = serde_json::from_str(body).map_err(|e| format!("invalid JSON: {e}"))?;
            vec![v]
        }
        Shape::Lines if body.starts_with('[') => {
            let v: Value = serde_json::from_str(body).map_err(|e| format!("invalid JSON array: {e}"))?;
            match v {
                Value::Array(items) => items,
                _ => return Err("expected a JSON array".into()),
            }
        }
        Shape::Lines => body
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .enumerate()
            .map(|(n, line)| {
                serde_json::from_str::<Value>(line).map_err(|e| format!("line {}: {e}", n + 1))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?,
    };

    for (i, r) in records.iter().enumerate() {
        let Some(obj) = r.as_object() else {
            return Err(format!("record {} is not an object", i + 1));
        };
        match obj.get("name").and_then(Value::as_str) {
            Some(n) if !n.trim().is_empty() => {}
            _ => return Err(format!("record {} has no name", i + 1)),
        }
    }
    Ok(records)
}

/// Records of `text` that also fit the topic's record types, with
/// placeholder values already scrubbed.
pub fn validate(text: &str, schema: &Schema) -> std::result::Result<Vec<Value>, String> {
    let mut records = parse_records(text, schema.shape)?;
    for (i, r) in records.iter_mut().enumerate() {
        scrub_placeholders(r);
        (schema.check)(r).map_err(|e| format!("record {}: {e}", i + 1))?;
    }
    Ok(records)
}

/// Return the records in `text`, or ask the model to repair the original
/// text up to `max_tries - 1` times. Each repair request carries the
/// original text, never a previous failed repair.
pub async fn ensure_valid(
    llm: &dyn Completion,
    text: &str,
    schema: &Schema,
    max_tries: u32,
) -> Result<Vec<Value>> {
    let max_tries = max_tries.max(1);
    let mut reason = match validate(text, schema) {
        Ok(records) => return Ok(records),
        Err(e) => e,
    };

    let mut tries = 1;
    while tries < max_tries {
        tries += 1;
        warn!("{} payload invalid ({}); repair attempt {}/{}", schema.topic, reason, tries, max_tries);
        match llm.complete(&schema.repair, text).await {
            Ok(reply) => match validate(&reply, schema) {
                Ok(records) => {
                    debug!("repair attempt {} succeeded", tries);
                    return Ok(records);
                }
                Err(e) => reason = e,
            },
            Err(e) => reason = e.to_string(),
        }
    }
    Err(HunterError::InvalidPayload { tries, reason })
}
