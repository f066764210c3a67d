use super::credentials::CredentialProvider;
use super::sigv4::{RequestSigner, SigningRequest};
use super::{QueueError, QueueMessage, QueuePort, QueueResolver, QueueSink};
use chrono::Utc;
use reqwest::blocking::Client;
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const SERVICE: &str = "sqs";
const CONTENT_TYPE: &str = "application/x-amz-json-1.0";
const TARGET_PREFIX: &str = "AmazonSQS.";
/// SQS rejects long-poll waits above 20 seconds.
pub const MAX_WAIT_SECONDS: u64 = 20;
/// SQS rejects receive batches above 10 messages.
pub const MAX_BATCH: usize = 10;
const REQUEST_SLACK: Duration = Duration::from_secs(10);

/// Blocking SQS client speaking the AWS JSON 1.0 protocol.
#[derive(Debug, Clone)]
pub struct SqsClient {
    http: Client,
    endpoint: Url,
    host: String,
    region: String,
    credentials: CredentialProvider,
}

impl SqsClient {
    /// Creates a client for `region`, targeting `endpoint` when given
    /// (e.g. a local ElasticMQ) and the regional SQS endpoint otherwise.
    pub fn new(
        region: &str,
        endpoint: Option<&str>,
        credentials: CredentialProvider,
    ) -> Result<Self, QueueError> {
        if region.trim().is_empty() {
            return Err(QueueError::Configuration("aws region must not be empty".into()));
        }
        let raw = endpoint
            .map(str::to_string)
            .unwrap_or_else(|| format!("https://sqs.{region}.amazonaws.com/"));
        let endpoint = Url::parse(&raw)
            .map_err(|err| QueueError::Configuration(format!("invalid sqs endpoint {raw}: {err}")))?;
        let host = match (endpoint.host_str(), endpoint.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(QueueError::Configuration(format!(
                    "sqs endpoint {raw} has no host"
                )))
            }
        };
        let http = Client::builder()
            .build()
            .map_err(|err| QueueError::Configuration(format!("http client build failed: {err}")))?;
        Ok(Self {
            http,
            endpoint,
            host,
            region: region.to_string(),
            credentials,
        })
    }

    /// Resolves a queue name to its URL.
    pub fn queue_url(&self, queue_name: &str) -> Result<String, QueueError> {
        let response: GetQueueUrlResponse = self.call(
            "GetQueueUrl",
            &GetQueueUrlRequest {
                queue_name: queue_name.to_string(),
            },
            queue_name,
            REQUEST_SLACK,
        )?;
        Ok(response.queue_url)
    }

    fn call<Req, Resp>(
        &self,
        action: &str,
        request: &Req,
        queue: &str,
        timeout: Duration,
    ) -> Result<Resp, QueueError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_vec(request)
            .map_err(|err| QueueError::Transport(format!("{action} encode failed: {err}")))?;
        let target = format!("{TARGET_PREFIX}{action}");
        let credentials = self.credentials.credentials()?;
        let signer = RequestSigner::new(
            credentials.access_key_id,
            credentials.secret_access_key,
            self.region.as_str(),
            SERVICE,
        )
        .with_session_token(credentials.session_token);
        let signed = signer
            .sign(
                &SigningRequest {
                    method: "POST",
                    host: &self.host,
                    path: self.endpoint.path(),
                    query: "",
                    headers: &[("content-type", CONTENT_TYPE), ("x-amz-target", target.as_str())],
                    payload: &payload,
                },
                Utc::now(),
            )
            .map_err(|err| QueueError::Configuration(err.to_string()))?;

        let mut builder = self
            .http
            .post(self.endpoint.clone())
            .timeout(timeout)
            .header("content-type", CONTENT_TYPE)
            .header("x-amz-target", &target)
            .header("x-amz-date", &signed.amz_date)
            .header("authorization", &signed.authorization);
        if let Some(token) = &signed.security_token {
            builder = builder.header("x-amz-security-token", token);
        }
        debug!(action, queue, "sqs request");
        let response = builder
            .body(payload)
            .send()
            .map_err(|err| QueueError::Transport(format!("{action} failed: {err}")))?;
        let status = response.status();
        let body = response
            .text()
            .map_err(|err| QueueError::Transport(format!("{action} read failed: {err}")))?;
        if !status.is_success() {
            return Err(error_from_response(queue, status.as_u16(), &body));
        }
        let body = if body.trim().is_empty() { "{}" } else { body.as_str() };
        serde_json::from_str(body)
            .map_err(|err| QueueError::Transport(format!("{action} decode failed: {err}")))
    }
}

impl QueueResolver for SqsClient {
    type Queue = SqsQueue;

    fn open(&mut self, queue_name: &str) -> Result<Self::Queue, QueueError> {
        if queue_name.trim().is_empty() {
            return Err(QueueError::Configuration("queue name must not be empty".into()));
        }
        let url = self.queue_url(queue_name)?;
        Ok(SqsQueue {
            client: self.clone(),
            name: queue_name.to_string(),
            url,
        })
    }
}

/// Handle for one resolved SQS queue.
#[derive(Debug, Clone)]
pub struct SqsQueue {
    client: SqsClient,
    name: String,
    url: String,
}

impl SqsQueue {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl QueueSink for SqsQueue {
    fn send(&mut self, body: &str) -> Result<String, QueueError> {
        let response: SendMessageResponse = self.client.call(
            "SendMessage",
            &SendMessageRequest {
                queue_url: self.url.clone(),
                message_body: body.to_string(),
            },
            &self.name,
            REQUEST_SLACK,
        )?;
        Ok(response.message_id)
    }
}

impl QueuePort for SqsQueue {
    fn receive(
        &mut self,
        wait: Duration,
        max_messages: usize,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let wait_seconds = wait.as_secs().min(MAX_WAIT_SECONDS);
        let response: ReceiveMessageResponse = self.client.call(
            "ReceiveMessage",
            &ReceiveMessageRequest {
                queue_url: self.url.clone(),
                max_number_of_messages: max_messages.clamp(1, MAX_BATCH) as u32,
                wait_time_seconds: wait_seconds as u32,
            },
            &self.name,
            Duration::from_secs(wait_seconds) + REQUEST_SLACK,
        )?;
        Ok(response
            .messages
            .into_iter()
            .map(|message| QueueMessage {
                message_id: message.message_id,
                receipt_handle: message.receipt_handle,
                body: message.body,
            })
            .collect())
    }

    fn delete(&mut self, message: &QueueMessage) -> Result<(), QueueError> {
        let _: EmptyResponse = self.client.call(
            "DeleteMessage",
            &DeleteMessageRequest {
                queue_url: self.url.clone(),
                receipt_handle: message.receipt_handle.clone(),
            },
            &self.name,
            REQUEST_SLACK,
        )?;
        Ok(())
    }
}

/// Maps an SQS error response onto [`QueueError`].
pub fn error_from_response(queue: &str, status: u16, body: &str) -> QueueError {
    let parsed: Option<WireError> = serde_json::from_str(body).ok();
    let (code, message) = match parsed {
        Some(error) => (
            error
                .kind
                .rsplit('#')
                .next()
                .unwrap_or_default()
                .to_string(),
            error.message.unwrap_or_default(),
        ),
        None => (format!("HTTP{status}"), body.trim().to_string()),
    };
    if code == "QueueDoesNotExist" || code.ends_with("NonExistentQueue") {
        return QueueError::NotFound {
            queue: queue.to_string(),
        };
    }
    QueueError::Rejected { code, message }
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(rename = "__type", default)]
    kind: String,
    #[serde(alias = "Message", default)]
    message: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct GetQueueUrlRequest {
    queue_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetQueueUrlResponse {
    queue_url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SendMessageRequest {
    queue_url: String,
    message_body: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SendMessageResponse {
    message_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ReceiveMessageRequest {
    queue_url: String,
    max_number_of_messages: u32,
    wait_time_seconds: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ReceiveMessageResponse {
    #[serde(default)]
    messages: Vec<WireMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireMessage {
    message_id: String,
    receipt_handle: String,
    body: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct DeleteMessageRequest {
    queue_url: String,
    receipt_handle: String,
}

#[derive(Debug, Deserialize)]
struct EmptyResponse {}
