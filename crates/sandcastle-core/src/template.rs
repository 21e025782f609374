// Copyright (c) 2025 Sandcastle Contributors
// SPDX-License-Identifier: Apache-2.0

//! `{token}` and `{storage.path}` template substitution over run context.

use crate::value::{Value, ValueMap};
use chrono::Utc;
use regex::Regex;
use std::sync::OnceLock;
use uuid::Uuid;

fn token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([a-zA-Z_][a-zA-Z0-9_.]*)\}").unwrap())
}

fn storage_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{storage\.([^}]+)\}").unwrap())
}

/// Run context visible to template resolution: inputs, step outputs so far,
/// and the run identity.
pub struct RenderContext<'a> {
    pub run_id: Uuid,
    pub input: &'a ValueMap,
    pub step_outputs: &'a ValueMap,
}

/// Resolves a single `{token}` by walking `input.*` or `steps.*.output[.*]`
/// paths, or returning the `run_id`/`date` scalars. Returns `None` if the
/// token cannot be resolved (caller leaves it verbatim).
fn resolve_token(token: &str, ctx: &RenderContext) -> Option<Value> {
    if token == "run_id" {
        return Some(Value::Scalar(ctx.run_id.to_string()));
    }
    if token == "date" {
        return Some(Value::Scalar(Utc::now().format("%Y-%m-%d").to_string()));
    }
    if let Some(path) = token.strip_prefix("input.") {
        let root = Value::Json(serde_json::to_value(ctx.input).ok()?);
        return root.get_path(path);
    }
    if let Some(rest) = token.strip_prefix("steps.") {
        let mut parts = rest.splitn(2, '.');
        let step_id = parts.next()?;
        let after_step = parts.next().unwrap_or("");
        let output = ctx.step_outputs.get(step_id)?;
        let after_output = after_step.strip_prefix("output")?;
        let path = after_output.strip_prefix('.').unwrap_or("");
        if path.is_empty() {
            return Some(output.clone());
        }
        return output.get_path(path);
    }
    None
}

/// Public entry point for resolving a single dotted path outside of string
/// substitution, e.g. `parallel_over: steps.fetch.output.items`.
pub fn resolve_path(token: &str, ctx: &RenderContext) -> Option<Value> {
    resolve_token(token, ctx)
}

/// Substitutes all `{token}` occurrences in `text`. Unresolved tokens are
/// left verbatim. Non-string values are JSON-encoded.
pub fn resolve_templates(text: &str, ctx: &RenderContext) -> String {
    token_regex()
        .replace_all(text, |caps: &regex::Captures| {
            let token = &caps[1];
            match resolve_token(token, ctx) {
                Some(value) => value.render(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Replaces `{storage.path}` references, reading each blob sequentially
/// (ordering must be preserved when storage reads have side effects).
pub async fn resolve_storage_refs<F, Fut>(text: &str, mut read: F) -> String
where
    F: FnMut(String) -> Fut,
    Fut: std::future::Future<Output = Option<String>>,
{
    let matches: Vec<(std::ops::Range<usize>, String)> = storage_regex()
        .captures_iter(text)
        .map(|c| {
            let m = c.get(0).unwrap();
            (m.range(), c[1].to_string())
        })
        .collect();

    if matches.is_empty() {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for (range, path) in matches {
        out.push_str(&text[cursor..range.start]);
        match read(path).await {
            Some(content) => out.push_str(&content),
            None => out.push_str(&text[range.clone()]),
        }
        cursor = range.end;
    }
    out.push_str(&text[cursor..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn ctx(run_id: Uuid, input: &ValueMap, outputs: &ValueMap) -> RenderContext<'_> {
        RenderContext { run_id, input, step_outputs: outputs }
    }

    #[test]
    fn no_tokens_returns_unchanged() {
        let input = HashMap::new();
        let outputs = HashMap::new();
        let c = ctx(Uuid::nil(), &input, &outputs);
        assert_eq!(resolve_templates("hello world", &c), "hello world");
    }

    #[test]
    fn resolves_input_path() {
        let mut input = HashMap::new();
        input.insert("name".to_string(), Value::Scalar("World".to_string()));
        let outputs = HashMap::new();
        let c = ctx(Uuid::nil(), &input, &outputs);
        assert_eq!(resolve_templates("Hello, {input.name}!", &c), "Hello, World!");
    }

    #[test]
    fn resolves_step_output() {
        let input = HashMap::new();
        let mut outputs = HashMap::new();
        outputs.insert("a".to_string(), Value::Scalar("42".to_string()));
        let c = ctx(Uuid::nil(), &input, &outputs);
        assert_eq!(resolve_templates("{steps.a.output}", &c), "42");
    }

    #[test]
    fn unresolved_token_left_verbatim() {
        let input = HashMap::new();
        let outputs = HashMap::new();
        let c = ctx(Uuid::nil(), &input, &outputs);
        assert_eq!(resolve_templates("{input.missing}", &c), "{input.missing}");
    }

    #[test]
    fn resolving_twice_is_stable() {
        let input = HashMap::new();
        let outputs = HashMap::new();
        let c = ctx(Uuid::nil(), &input, &outputs);
        let once = resolve_templates("plain text", &c);
        let twice = resolve_templates(&once, &c);
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn storage_refs_resolved_sequentially() {
        let order = std::sync::Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let order2 = order.clone();
        let resolved = resolve_storage_refs("{storage.a} then {storage.b}", move |path| {
            let order = order2.clone();
            async move {
                order.lock().await.push(path.clone());
                Some(format!("<{}>", path))
            }
        })
        .await;
        assert_eq!(resolved, "<a> then <b>");
        assert_eq!(*order.lock().await, vec!["a".to_string(), "b".to_string()]);
    }
}
