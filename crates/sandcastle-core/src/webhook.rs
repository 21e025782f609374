// Copyright (c) 2025 Sandcastle Contributors
// SPDX-License-Identifier: Apache-2.0

//! HMAC-signed completion/failure webhook dispatch with exponential backoff.

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::time::Duration;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    pub event: String,
    pub run_id: Uuid,
    pub workflow: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<serde_json::Value>,
    pub costs: f64,
    pub duration_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: chrono::DateTime<Utc>,
}

pub fn sign_payload(body: &str, secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub fn verify_signature(body: &str, signature: &str, secret: &str) -> bool {
    let expected = sign_payload(body, secret);
    constant_time_eq(expected.as_bytes(), signature.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

pub struct WebhookDispatcher {
    client: reqwest::Client,
    secret: String,
    max_retries: u32,
}

impl WebhookDispatcher {
    pub fn new(secret: impl Into<String>, max_retries: u32) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client builds with default TLS backend"),
            secret: secret.into(),
            max_retries,
        }
    }

    /// Sends a webhook with HMAC signing and retries. Never returns an
    /// error: delivery failure is reported as `false`.
    pub async fn dispatch(&self, url: &str, payload: &WebhookPayload) -> bool {
        let body = match serde_json::to_string(payload) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(error = %e, "webhook payload failed to serialize");
                return false;
            }
        };
        let signature = sign_payload(&body, &self.secret);

        for attempt in 1..=self.max_retries {
            let result = self
                .client
                .post(url)
                .header("Content-Type", "application/json")
                .header("X-Sandcastle-Signature", &signature)
                .header("X-Sandcastle-Event", &payload.event)
                .body(body.clone())
                .send()
                .await;

            match result {
                Ok(response) if response.status().as_u16() < 400 => {
                    tracing::info!(
                        event = %payload.event,
                        run_id = %payload.run_id,
                        status = response.status().as_u16(),
                        "webhook delivered"
                    );
                    return true;
                }
                Ok(response) => {
                    tracing::warn!(attempt, status = response.status().as_u16(), url, "webhook non-2xx response");
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "webhook attempt failed");
                }
            }

            if attempt < self.max_retries {
                let delay = 2u64.saturating_pow(attempt).min(30);
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }
        }

        tracing::error!(
            event = %payload.event,
            run_id = %payload.run_id,
            url,
            "webhook delivery failed after {} attempts",
            self.max_retries
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trips() {
        let body = r#"{"event":"workflow.completed"}"#;
        let signature = sign_payload(body, "shh");
        assert!(verify_signature(body, &signature, "shh"));
        assert!(!verify_signature(body, &signature, "wrong"));
    }

    #[tokio::test]
    async fn dispatch_succeeds_on_2xx() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("POST", "/hook").with_status(200).create_async().await;

        let dispatcher = WebhookDispatcher::new("secret", 3);
        let payload = WebhookPayload {
            event: "workflow.completed".to_string(),
            run_id: Uuid::nil(),
            workflow: "wf".to_string(),
            status: "completed".to_string(),
            outputs: None,
            costs: 0.01,
            duration_seconds: 1.0,
            error: None,
            timestamp: Utc::now(),
        };
        let ok = dispatcher.dispatch(&format!("{}/hook", server.url()), &payload).await;
        assert!(ok);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn dispatch_fails_after_exhausting_retries() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("POST", "/hook").with_status(500).expect(2).create_async().await;

        let dispatcher = WebhookDispatcher::new("secret", 2);
        let payload = WebhookPayload {
            event: "workflow.failed".to_string(),
            run_id: Uuid::nil(),
            workflow: "wf".to_string(),
            status: "failed".to_string(),
            outputs: None,
            costs: 0.0,
            duration_seconds: 0.5,
            error: Some("boom".to_string()),
            timestamp: Utc::now(),
        };
        let ok = dispatcher.dispatch(&format!("{}/hook", server.url()), &payload).await;
        assert!(!ok);
        mock.assert_async().await;
    }
}
