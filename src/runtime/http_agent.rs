/// Agent that delegates to a downstream HTTP service
///
/// Each invocation is `POST {endpoint}/agents/{job name}` with the job's
/// payload and its prerequisites' outputs. A 2xx JSON body becomes the
/// job's return value. Domain events listed under the body's `events` key
/// (`[{"type": "serp.rank.anomaly", "payload": {..}}]`) are published on the
/// job's tenant channel.

use crate::events::{Event, EventType};
use crate::runtime::agent::{Agent, AgentError, AgentRegistry, ExecutionContext};
use crate::workflow::types::{AgentTask, JobPayload};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

pub struct HttpAgent {
    endpoint: String,
    http: reqwest::Client,
}

impl HttpAgent {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url_for(&self, agent: &str) -> String {
        format!("{}/agents/{}", self.endpoint, agent)
    }
}

/// Statuses worth another attempt; every other non-2xx is final
fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

#[async_trait]
impl Agent for HttpAgent {
    async fn run(&self, payload: &JobPayload, ctx: &ExecutionContext) -> Result<Value, AgentError> {
        let url = self.url_for(&ctx.job_name);
        let body = json!({
            "jobId": ctx.job_id,
            "jobName": ctx.job_name,
            "attempt": ctx.attempt,
            "payload": payload,
            "childrenValues": ctx.children_values(),
        });

        tracing::debug!(job_id = %ctx.job_id, "🌐 POST {}", url);
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::retryable(format!("request to {url} failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let message = format!("agent service returned {status}: {text}");
            return Err(if is_retryable_status(status) {
                AgentError::retryable(message)
            } else {
                AgentError::terminal(message)
            });
        }

        let value = resp
            .json::<Value>()
            .await
            .map_err(|e| AgentError::terminal(format!("invalid JSON from agent service: {e}")))?;
        forward_events(&value, ctx).await;
        Ok(value)
    }
}

#[derive(Debug, Deserialize)]
struct RaisedEvent {
    #[serde(rename = "type")]
    event_type: EventType,
    #[serde(default)]
    payload: Value,
}

/// Publish the domain events an agent service reported
async fn forward_events(body: &Value, ctx: &ExecutionContext) {
    let Some(raised) = body.get("events").and_then(Value::as_array) else {
        return;
    };
    for item in raised {
        let raised = match serde_json::from_value::<RaisedEvent>(item.clone()) {
            Ok(raised) if raised.event_type.is_domain() => raised,
            Ok(raised) => {
                tracing::warn!(job_id = %ctx.job_id, "⚠️ Ignoring non-domain event {} from agent service", raised.event_type);
                continue;
            }
            Err(e) => {
                tracing::warn!(job_id = %ctx.job_id, "⚠️ Ignoring malformed event from agent service: {}", e);
                continue;
            }
        };

        let mut payload = raised.payload;
        if let Some(fields) = payload.as_object_mut() {
            fields.insert("tenantId".into(), Value::String(ctx.tenant_id.clone()));
        }
        let event = Event::new(raised.event_type, ctx.tenant_id.clone(), payload);
        if let Err(e) = ctx.emit(&event).await {
            tracing::warn!(job_id = %ctx.job_id, "⚠️ Failed to publish {}: {}", event.event_type, e);
        }
    }
}

/// Route every built-in agent id to the same downstream service
pub fn register_http_agents(agents: &mut AgentRegistry, agent: Arc<HttpAgent>) {
    for name in AgentTask::BUILTIN_AGENTS {
        agents.register(*name, agent.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::types::{ChildResult, JobState};
    use crate::events::EventBus;
    use crate::workflow::types::{DomainParams, FlowInput};
    use std::path::PathBuf;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ctx() -> ExecutionContext {
        ExecutionContext {
            job_id: "job-1".into(),
            tenant_id: "tenant-a".into(),
            job_name: "technical-audit".into(),
            queue: "smart-agents".into(),
            flow_id: "flow-1".into(),
            attempt: 1,
            max_attempts: 3,
            workspace: PathBuf::from("/tmp"),
            children: vec![ChildResult {
                job_id: "job-0".into(),
                name: "site-speed".into(),
                state: JobState::Completed,
                value: Some(json!({"lcp": 1.2})),
                error: None,
            }],
            events: EventBus::in_memory("test"),
        }
    }

    fn payload() -> JobPayload {
        FlowInput::new("tenant-a", "proj-1").payload(AgentTask::TechnicalAudit(DomainParams {
            domain: "example.com".into(),
        }))
    }

    async fn agent_with(status: u16, body: Value) -> (MockServer, HttpAgent) {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agents/technical-audit"))
            .respond_with(ResponseTemplate::new(status).set_body_json(body))
            .mount(&server)
            .await;
        let agent = HttpAgent::new(server.uri(), Duration::from_secs(5)).unwrap();
        (server, agent)
    }

    #[tokio::test]
    async fn test_success_returns_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agents/technical-audit"))
            .and(body_partial_json(json!({
                "jobId": "job-1",
                "childrenValues": {"site-speed": {"lcp": 1.2}},
                "payload": {"tenantId": "tenant-a"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"score": 91})))
            .mount(&server)
            .await;

        let agent = HttpAgent::new(format!("{}/", server.uri()), Duration::from_secs(5)).unwrap();
        let out = agent.run(&payload(), &ctx()).await.unwrap();
        assert_eq!(out, json!({"score": 91}));
    }

    #[tokio::test]
    async fn test_reported_domain_events_are_published() {
        let (_server, agent) = agent_with(
            200,
            json!({
                "positions": 2,
                "events": [
                    {"type": "serp.rank.anomaly", "payload": {"keyword": "rust", "previousPosition": 2, "currentPosition": 11}},
                    {"type": "agent.task.completed", "payload": {}},
                    {"type": "made.up"}
                ]
            }),
        )
        .await;
        let ctx = ctx();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let subscription = ctx.events.subscribe("tenant-a", move |event: Event| {
            let _ = tx.send(event);
        });
        subscription.start().await.unwrap();

        let out = agent.run(&payload(), &ctx).await.unwrap();
        assert_eq!(out["positions"], 2);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::SerpRankAnomaly);
        assert_eq!(event.tenant_id, "tenant-a");
        assert_eq!(event.payload["tenantId"], "tenant-a");
        assert_eq!(event.payload["currentPosition"], 11);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let (_server, agent) = agent_with(503, json!({"error": "busy"})).await;
        let err = agent.run(&payload(), &ctx()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_rate_limit_is_retryable() {
        let (_server, agent) = agent_with(429, json!({})).await;
        assert!(agent.run(&payload(), &ctx()).await.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_client_error_is_terminal() {
        let (_server, agent) = agent_with(422, json!({"error": "bad domain"})).await;
        let err = agent.run(&payload(), &ctx()).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.message().contains("422"));
    }

    #[tokio::test]
    async fn test_unreachable_service_is_retryable() {
        let agent = HttpAgent::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        assert!(agent.run(&payload(), &ctx()).await.unwrap_err().is_retryable());
    }

    #[test]
    fn test_registers_every_builtin_agent() {
        let agent = Arc::new(HttpAgent::new("http://localhost", Duration::from_secs(1)).unwrap());
        let mut agents = AgentRegistry::new();
        register_http_agents(&mut agents, agent);
        assert_eq!(agents.len(), AgentTask::BUILTIN_AGENTS.len());
        assert!(agents.get("rank-tracker").is_some());
    }
}
