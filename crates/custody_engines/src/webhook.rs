#![forbid(unsafe_code)]

use std::env;
use std::time::Duration;

use custody_contracts::delivery::{DeliveryTarget, DeliveryTaskRecord};

pub const WEBHOOK_RETRY_AFTER_MS_DEFAULT: u32 = 30_000;

/// Failure classification for a delivery attempt. Transient failures
/// re-enter the backoff path; permanent failures go straight to
/// operator triage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryErrorClass {
    Transient,
    Permanent,
}

/// HTTP status heuristics: 408/429/5xx are transient, other 4xx are
/// permanent. Everything ambiguous (timeouts, transport errors) is
/// transient; the idempotency key embedded in every envelope makes a
/// duplicate re-send safe on the target side.
pub fn classify_http_status(status: u16) -> Option<DeliveryErrorClass> {
    match status {
        200..=299 => None,
        408 | 429 => Some(DeliveryErrorClass::Transient),
        400..=499 => Some(DeliveryErrorClass::Permanent),
        _ => Some(DeliveryErrorClass::Transient),
    }
}

/// The wire payload handed to a target. The idempotency key is always
/// included so targets can deduplicate ambiguous re-sends.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DeliveryEnvelope {
    pub schema_version: u8,
    pub task_id: u64,
    pub event_type: String,
    pub idempotency_key: String,
    pub attempt_count: u16,
    pub payload: serde_json::Value,
}

impl DeliveryEnvelope {
    pub fn from_task(task: &DeliveryTaskRecord) -> Result<Self, DeliverySendFailure> {
        let payload: serde_json::Value =
            serde_json::from_str(&task.payload_json).map_err(|err| {
                DeliverySendFailure::permanent(format!("task payload is not valid JSON: {err}"))
            })?;
        Ok(Self {
            schema_version: 1,
            task_id: task.task_id.0,
            event_type: task.event_type.as_str().to_string(),
            idempotency_key: task.idempotency_key.clone(),
            attempt_count: task.attempt_count,
            payload,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliverySendReceipt {
    pub remote_ack_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliverySendFailure {
    pub message: String,
    pub class: DeliveryErrorClass,
    pub retry_after_ms: Option<u32>,
}

impl DeliverySendFailure {
    pub fn transient(message: impl Into<String>, retry_after_ms: Option<u32>) -> Self {
        Self {
            message: bounded_message(message.into()),
            class: DeliveryErrorClass::Transient,
            retry_after_ms: retry_after_ms.map(|ms| ms.clamp(1_000, 300_000)),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: bounded_message(message.into()),
            class: DeliveryErrorClass::Permanent,
            retry_after_ms: None,
        }
    }
}

fn bounded_message(msg: String) -> String {
    if msg.len() > 256 {
        msg.chars().take(256).collect()
    } else {
        msg
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSenderConfig {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub bearer_token: Option<String>,
}

impl HttpSenderConfig {
    pub fn mvp_v1() -> Self {
        Self {
            connect_timeout_ms: 3_000,
            request_timeout_ms: 10_000,
            bearer_token: None,
        }
    }

    pub fn from_env() -> Self {
        let connect_timeout_ms = env::var("CUSTODY_WEBHOOK_CONNECT_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| (100..=60_000).contains(v))
            .unwrap_or(3_000);
        let request_timeout_ms = env::var("CUSTODY_WEBHOOK_REQUEST_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| (100..=120_000).contains(v))
            .unwrap_or(10_000);
        let bearer_token = env::var("CUSTODY_WEBHOOK_BEARER").ok().and_then(|v| {
            let s = v.trim().to_string();
            if s.is_empty() {
                None
            } else {
                Some(s)
            }
        });
        Self {
            connect_timeout_ms,
            request_timeout_ms,
            bearer_token,
        }
    }
}

/// Outbound transport for delivery attempts. `Loopback` acknowledges
/// everything locally (internal handlers and tests); `Http` posts
/// webhook envelopes; `AlwaysFail` injects failures for worker tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderRuntime {
    Loopback,
    Http(HttpSenderConfig),
    AlwaysFail {
        message: String,
        class: DeliveryErrorClass,
        retry_after_ms: Option<u32>,
    },
}

impl Default for SenderRuntime {
    fn default() -> Self {
        Self::Http(HttpSenderConfig::from_env())
    }
}

impl SenderRuntime {
    pub fn always_fail_transient(message: &str, retry_after_ms: u32) -> Self {
        Self::AlwaysFail {
            message: message.to_string(),
            class: DeliveryErrorClass::Transient,
            retry_after_ms: Some(retry_after_ms),
        }
    }

    pub fn always_fail_permanent(message: &str) -> Self {
        Self::AlwaysFail {
            message: message.to_string(),
            class: DeliveryErrorClass::Permanent,
            retry_after_ms: None,
        }
    }

    pub fn send(
        &self,
        target: &DeliveryTarget,
        envelope: &DeliveryEnvelope,
    ) -> Result<DeliverySendReceipt, DeliverySendFailure> {
        match self {
            SenderRuntime::AlwaysFail {
                message,
                class,
                retry_after_ms,
            } => Err(match class {
                DeliveryErrorClass::Transient => {
                    DeliverySendFailure::transient(message.clone(), *retry_after_ms)
                }
                DeliveryErrorClass::Permanent => DeliverySendFailure::permanent(message.clone()),
            }),
            SenderRuntime::Loopback => Ok(loopback_ack(target, envelope)),
            SenderRuntime::Http(config) => match target {
                // Internal callbacks are dispatched in-process by the
                // host; the queue only needs the acknowledgement.
                DeliveryTarget::Internal { .. } => Ok(loopback_ack(target, envelope)),
                DeliveryTarget::Webhook { url } => send_http_envelope(config, url, envelope),
            },
        }
    }
}

fn loopback_ack(target: &DeliveryTarget, envelope: &DeliveryEnvelope) -> DeliverySendReceipt {
    DeliverySendReceipt {
        remote_ack_ref: Some(format!("loopback_ack:{}:{}", target.label(), envelope.task_id)),
    }
}

fn send_http_envelope(
    config: &HttpSenderConfig,
    url: &str,
    envelope: &DeliveryEnvelope,
) -> Result<DeliverySendReceipt, DeliverySendFailure> {
    let payload = serde_json::to_string(envelope).map_err(|err| {
        DeliverySendFailure::permanent(format!("envelope encode failed: {err}"))
    })?;
    let agent = ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_millis(config.connect_timeout_ms))
        .timeout_read(Duration::from_millis(config.request_timeout_ms))
        .timeout_write(Duration::from_millis(config.request_timeout_ms))
        .build();
    let mut req = agent
        .post(url)
        .set("content-type", "application/json")
        .set("idempotency-key", &envelope.idempotency_key)
        .set("x-custody-task-id", &envelope.task_id.to_string());
    if let Some(token) = config.bearer_token.as_ref() {
        req = req.set("authorization", &format!("Bearer {token}"));
    }
    match req.send_string(&payload) {
        Ok(resp) => match classify_http_status(resp.status()) {
            None => Ok(DeliverySendReceipt {
                remote_ack_ref: Some(format!("http:{}:{}", resp.status(), envelope.task_id)),
            }),
            Some(DeliveryErrorClass::Transient) => {
                let retry_after = parse_retry_after_ms(resp.header("retry-after"));
                Err(DeliverySendFailure::transient(
                    format!("delivery failed with http status {}", resp.status()),
                    retry_after,
                ))
            }
            Some(DeliveryErrorClass::Permanent) => Err(DeliverySendFailure::permanent(format!(
                "delivery rejected with http status {}",
                resp.status()
            ))),
        },
        Err(ureq::Error::Status(code, resp)) => match classify_http_status(code) {
            Some(DeliveryErrorClass::Permanent) => Err(DeliverySendFailure::permanent(format!(
                "delivery rejected with http status {code}"
            ))),
            _ => {
                let retry_after = parse_retry_after_ms(resp.header("retry-after"));
                Err(DeliverySendFailure::transient(
                    format!("delivery failed with http status {code}"),
                    retry_after,
                ))
            }
        },
        Err(ureq::Error::Transport(err)) => Err(DeliverySendFailure::transient(
            format!("delivery transport error: {err}"),
            None,
        )),
    }
}

fn parse_retry_after_ms(retry_after_header: Option<&str>) -> Option<u32> {
    let header = retry_after_header?;
    let seconds = header.trim().parse::<u32>().ok()?;
    let ms = seconds.saturating_mul(1_000);
    if (1_000..=300_000).contains(&ms) {
        Some(ms)
    } else {
        Some(WEBHOOK_RETRY_AFTER_MS_DEFAULT)
    }
}
