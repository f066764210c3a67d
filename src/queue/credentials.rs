//! AWS credential resolution for the SQS adapter.
//!
//! Sources are detected in the usual SDK order: static keys from the
//! environment, web identity (IRSA), the container credentials endpoint, and
//! finally EC2 instance metadata. Temporary credentials are cached and
//! refreshed shortly before they expire.

use super::QueueError;
use chrono::{DateTime, Utc};
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::Deserialize;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

/// Host serving container credentials for `AWS_CONTAINER_CREDENTIALS_RELATIVE_URI`.
pub const CONTAINER_CREDENTIALS_HOST: &str = "http://169.254.170.2";
/// Default EC2 instance metadata endpoint.
pub const INSTANCE_METADATA_ENDPOINT: &str = "http://169.254.169.254";

const STS_VERSION: &str = "2011-06-15";
const IMDS_TOKEN_TTL_SECONDS: &str = "21600";
const REFRESH_MARGIN_SECONDS: i64 = 300;
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// One set of AWS credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
            expires_at: None,
        }
    }

    pub fn with_session_token(mut self, token: Option<String>) -> Self {
        self.session_token = token.filter(|token| !token.is_empty());
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Static credentials never expire; temporary ones are refreshed five minutes early.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => (expires_at - now).num_seconds() > REFRESH_MARGIN_SECONDS,
            None => true,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Where credentials come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` / `AWS_SESSION_TOKEN`.
    Static(Credentials),
    /// `AWS_ROLE_ARN` plus `AWS_WEB_IDENTITY_TOKEN_FILE`, as injected for IRSA.
    WebIdentity {
        role_arn: String,
        token_file: PathBuf,
        session_name: String,
    },
    /// ECS task roles and EKS Pod Identity.
    Container {
        uri: String,
        authorization: Option<String>,
        authorization_file: Option<PathBuf>,
    },
    /// EC2 instance profile through IMDSv2.
    InstanceMetadata { endpoint: String },
}

impl CredentialSource {
    pub fn from_env() -> Result<Self, QueueError> {
        Self::detect(|name| env::var(name).ok())
    }

    /// Picks the first source whose variables are present.
    pub fn detect(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, QueueError> {
        let var = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let (Some(access_key_id), Some(secret_access_key)) =
            (var("AWS_ACCESS_KEY_ID"), var("AWS_SECRET_ACCESS_KEY"))
        {
            return Ok(Self::Static(
                Credentials::new(access_key_id, secret_access_key)
                    .with_session_token(var("AWS_SESSION_TOKEN")),
            ));
        }

        if let (Some(token_file), Some(role_arn)) =
            (var("AWS_WEB_IDENTITY_TOKEN_FILE"), var("AWS_ROLE_ARN"))
        {
            let session_name = var("AWS_ROLE_SESSION_NAME")
                .unwrap_or_else(|| format!("kube-pico-cd-{}", Utc::now().timestamp()));
            return Ok(Self::WebIdentity {
                role_arn,
                token_file: PathBuf::from(token_file),
                session_name,
            });
        }

        let container_uri = var("AWS_CONTAINER_CREDENTIALS_FULL_URI").or_else(|| {
            var("AWS_CONTAINER_CREDENTIALS_RELATIVE_URI")
                .map(|path| format!("{CONTAINER_CREDENTIALS_HOST}{path}"))
        });
        if let Some(uri) = container_uri {
            return Ok(Self::Container {
                uri,
                authorization: var("AWS_CONTAINER_AUTHORIZATION_TOKEN"),
                authorization_file: var("AWS_CONTAINER_AUTHORIZATION_TOKEN_FILE")
                    .map(PathBuf::from),
            });
        }

        if var("AWS_EC2_METADATA_DISABLED").is_some_and(|value| value.eq_ignore_ascii_case("true")) {
            return Err(QueueError::Configuration(
                "no AWS credentials found and instance metadata is disabled".into(),
            ));
        }
        let endpoint = var("AWS_EC2_METADATA_SERVICE_ENDPOINT")
            .unwrap_or_else(|| INSTANCE_METADATA_ENDPOINT.to_string());
        Ok(Self::InstanceMetadata {
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CredentialSource::Static(_) => "static",
            CredentialSource::WebIdentity { .. } => "web-identity",
            CredentialSource::Container { .. } => "container",
            CredentialSource::InstanceMetadata { .. } => "instance-metadata",
        }
    }
}

/// Resolves and caches credentials from one [`CredentialSource`]. Clones share the cache.
#[derive(Debug, Clone)]
pub struct CredentialProvider {
    source: CredentialSource,
    http: Client,
    sts_endpoint: String,
    cached: Arc<Mutex<Option<Credentials>>>,
}

impl CredentialProvider {
    /// Uses the regional STS endpoint for web identity exchanges.
    pub fn new(source: CredentialSource, region: &str) -> Result<Self, QueueError> {
        let http = Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|err| QueueError::Configuration(format!("http client build failed: {err}")))?;
        Ok(Self {
            source,
            http,
            sts_endpoint: format!("https://sts.{region}.amazonaws.com/"),
            cached: Arc::default(),
        })
    }

    pub fn with_sts_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.sts_endpoint = endpoint.into();
        self
    }

    pub fn source(&self) -> &CredentialSource {
        &self.source
    }

    /// Returns cached credentials, fetching new ones when absent or about to expire.
    pub fn credentials(&self) -> Result<Credentials, QueueError> {
        let mut cached = lock(&self.cached);
        if let Some(credentials) = cached.as_ref().filter(|c| c.is_fresh(Utc::now())) {
            return Ok(credentials.clone());
        }
        let fresh = self.fetch()?;
        debug!(
            source = self.source.kind(),
            expires_at = ?fresh.expires_at,
            "resolved aws credentials"
        );
        *cached = Some(fresh.clone());
        Ok(fresh)
    }

    fn fetch(&self) -> Result<Credentials, QueueError> {
        match &self.source {
            CredentialSource::Static(credentials) => Ok(credentials.clone()),
            CredentialSource::WebIdentity {
                role_arn,
                token_file,
                session_name,
            } => self.assume_role_with_web_identity(role_arn, token_file, session_name),
            CredentialSource::Container {
                uri,
                authorization,
                authorization_file,
            } => {
                let authorization = match authorization_file {
                    Some(path) => Some(read_token(path)?),
                    None => authorization.clone(),
                };
                let mut request = self.http.get(uri.as_str());
                if let Some(authorization) = authorization {
                    request = request.header("authorization", authorization);
                }
                credentials_from_json(&send(request, "container credentials")?)
            }
            CredentialSource::InstanceMetadata { endpoint } => self.instance_metadata(endpoint),
        }
    }

    fn assume_role_with_web_identity(
        &self,
        role_arn: &str,
        token_file: &Path,
        session_name: &str,
    ) -> Result<Credentials, QueueError> {
        let token = read_token(token_file)?;
        let request = self.http.post(self.sts_endpoint.as_str()).form(&[
            ("Action", "AssumeRoleWithWebIdentity"),
            ("Version", STS_VERSION),
            ("RoleArn", role_arn),
            ("RoleSessionName", session_name),
            ("WebIdentityToken", token.as_str()),
        ]);
        credentials_from_sts_xml(&send(request, "AssumeRoleWithWebIdentity")?)
    }

    fn instance_metadata(&self, endpoint: &str) -> Result<Credentials, QueueError> {
        let token = send(
            self.http
                .put(format!("{endpoint}/latest/api/token"))
                .header("x-aws-ec2-metadata-token-ttl-seconds", IMDS_TOKEN_TTL_SECONDS),
            "instance metadata token",
        )?;
        let token = token.trim();
        let roles = send(
            self.http
                .get(format!("{endpoint}/latest/meta-data/iam/security-credentials/"))
                .header("x-aws-ec2-metadata-token", token),
            "instance profile lookup",
        )?;
        let role = roles
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .ok_or_else(|| {
                QueueError::Configuration("instance profile has no role attached".into())
            })?;
        let body = send(
            self.http
                .get(format!(
                    "{endpoint}/latest/meta-data/iam/security-credentials/{role}"
                ))
                .header("x-aws-ec2-metadata-token", token),
            "instance profile credentials",
        )?;
        credentials_from_json(&body)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CredentialDocument {
    #[serde(default)]
    code: Option<String>,
    access_key_id: String,
    secret_access_key: String,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    expiration: Option<String>,
}

/// Parses the JSON document served by the container endpoint and by IMDS.
pub fn credentials_from_json(body: &str) -> Result<Credentials, QueueError> {
    let document: CredentialDocument = serde_json::from_str(body)
        .map_err(|err| QueueError::Transport(format!("unexpected credentials document: {err}")))?;
    if let Some(code) = document.code.filter(|code| code != "Success") {
        return Err(QueueError::Rejected {
            code,
            message: "credentials endpoint refused to issue credentials".into(),
        });
    }
    let mut credentials = Credentials::new(document.access_key_id, document.secret_access_key)
        .with_session_token(document.token);
    if let Some(expiration) = document.expiration {
        credentials = credentials.with_expiry(parse_expiration(&expiration)?);
    }
    Ok(credentials)
}

/// Parses an STS `AssumeRoleWithWebIdentity` XML response.
pub fn credentials_from_sts_xml(body: &str) -> Result<Credentials, QueueError> {
    let section = body
        .find("<Credentials>")
        .map(|start| &body[start..])
        .ok_or_else(|| QueueError::Transport("STS response has no Credentials element".into()))?;
    let field = |tag: &str| {
        xml_text(section, tag)
            .ok_or_else(|| QueueError::Transport(format!("STS response has no {tag} element")))
    };
    Ok(
        Credentials::new(field("AccessKeyId")?, field("SecretAccessKey")?)
            .with_session_token(Some(field("SessionToken")?))
            .with_expiry(parse_expiration(&field("Expiration")?)?),
    )
}

fn xml_text(document: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = document.find(&open)? + open.len();
    let end = start + document[start..].find(&close)?;
    let text = document[start..end]
        .trim()
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&");
    Some(text)
}

fn parse_expiration(raw: &str) -> Result<DateTime<Utc>, QueueError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|at| at.with_timezone(&Utc))
        .map_err(|err| QueueError::Transport(format!("invalid credential expiration {raw:?}: {err}")))
}

fn read_token(path: &Path) -> Result<String, QueueError> {
    fs::read_to_string(path)
        .map(|token| token.trim().to_string())
        .map_err(|err| {
            QueueError::Configuration(format!("failed to read token {}: {err}", path.display()))
        })
}

fn send(request: RequestBuilder, what: &str) -> Result<String, QueueError> {
    let response: Response = request
        .send()
        .map_err(|err| QueueError::Transport(format!("{what} request failed: {err}")))?;
    let status = response.status();
    let body = response
        .text()
        .map_err(|err| QueueError::Transport(format!("{what} read failed: {err}")))?;
    if !status.is_success() {
        return Err(QueueError::Rejected {
            code: format!("HTTP{}", status.as_u16()),
            message: body.trim().to_string(),
        });
    }
    Ok(body)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
