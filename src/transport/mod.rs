mod form;
#[cfg(any(test, feature = "test-support"))]
mod scripted;

pub use form::{FormPart, MultipartForm};
#[cfg(any(test, feature = "test-support"))]
pub use scripted::{RecordedCall, ScriptedExchange, ScriptedReply};

use crate::settings::ControllerSettings;
use reqwest::header::{HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::debug;
use url::Url;

const USER_AGENT: &str = "gpuwarden/0.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

/// Which remote base URL (and timeout class) a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Control,
    Inference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Json,
    Binary,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Json(Value),
    Form(MultipartForm),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    pub method: HttpMethod,
    pub endpoint: Endpoint,
    /// Fixed, already URL-safe path such as `datastore/label`.
    pub path: String,
    /// Caller-supplied values appended after `path`, each percent-encoded as one segment.
    pub segments: Vec<String>,
    pub query: Vec<(String, String)>,
    pub body: Option<RequestBody>,
    pub response_kind: ResponseKind,
    pub marks_activity: bool,
}

impl TransportRequest {
    pub fn new(endpoint: Endpoint, method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            endpoint,
            path: path.into(),
            segments: Vec::new(),
            query: Vec::new(),
            body: None,
            response_kind: ResponseKind::Json,
            // Control calls are answered by the router and never touch the instance.
            marks_activity: matches!(endpoint, Endpoint::Inference),
        }
    }

    pub fn get(endpoint: Endpoint, path: impl Into<String>) -> Self {
        Self::new(endpoint, HttpMethod::Get, path)
    }

    pub fn post(endpoint: Endpoint, path: impl Into<String>) -> Self {
        Self::new(endpoint, HttpMethod::Post, path)
    }

    pub fn put(endpoint: Endpoint, path: impl Into<String>) -> Self {
        Self::new(endpoint, HttpMethod::Put, path)
    }

    pub fn delete(endpoint: Endpoint, path: impl Into<String>) -> Self {
        Self::new(endpoint, HttpMethod::Delete, path)
    }

    pub fn segment(mut self, value: impl Into<String>) -> Self {
        self.segments.push(value.into());
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(RequestBody::Json(body));
        self
    }

    pub fn form(mut self, form: MultipartForm) -> Self {
        self.body = Some(RequestBody::Form(form));
        self
    }

    pub fn response(mut self, response_kind: ResponseKind) -> Self {
        self.response_kind = response_kind;
        self
    }

    pub fn marks_activity(mut self, marks_activity: bool) -> Self {
        self.marks_activity = marks_activity;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseData {
    Json(Value),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub data: ResponseData,
}

impl TransportResponse {
    pub fn json(&self) -> Option<&Value> {
        match &self.data {
            ResponseData::Json(value) => Some(value),
            ResponseData::Binary(_) => None,
        }
    }

    pub fn into_json(self) -> Result<Value, TransportError> {
        match self.data {
            ResponseData::Json(value) => Ok(value),
            ResponseData::Binary(_) => Err(TransportError::Decode(
                "expected a JSON response, got binary".to_string(),
            )),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self.data {
            ResponseData::Binary(bytes) => bytes,
            ResponseData::Json(value) => value.to_string().into_bytes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("network failure: {0}")]
    Network(String),
    #[error("server responded with HTTP {0}")]
    HttpStatus(u16),
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("invalid request URL: {0}")]
    InvalidUrl(String),
    #[error("failed to prepare request: {0}")]
    Setup(String),
}

/// Edge flag raised by successful calls and consumed once per timer tick.
#[derive(Debug, Clone, Default)]
pub struct ActivitySignal {
    raised: Arc<AtomicBool>,
}

impl ActivitySignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.raised.store(true, Ordering::Release);
    }

    /// Observe and clear in one step.
    pub fn take(&self) -> bool {
        self.raised.swap(false, Ordering::AcqRel)
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }
}

#[derive(Clone)]
pub struct Credential {
    token: Arc<str>,
}

impl Credential {
    pub fn new(token: impl AsRef<str>) -> Self {
        Self {
            token: Arc::from(token.as_ref()),
        }
    }

    fn authorization_header(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

#[derive(Clone)]
pub(crate) struct PreparedCall {
    pub(crate) method: HttpMethod,
    pub(crate) endpoint: Endpoint,
    pub(crate) url: Url,
    /// Path relative to the endpoint base, percent-encoded.
    pub(crate) route: String,
    pub(crate) query: Vec<(String, String)>,
    pub(crate) accept: &'static str,
    pub(crate) authorization: String,
    pub(crate) body: Option<RequestBody>,
}

#[derive(Debug, Clone)]
pub(crate) struct RawReply {
    pub(crate) status: u16,
    pub(crate) content_type: Option<String>,
    pub(crate) body: Vec<u8>,
}

#[derive(Clone)]
enum TransportBackend {
    Http {
        control: reqwest::Client,
        inference: reqwest::Client,
    },
    #[cfg(any(test, feature = "test-support"))]
    Scripted(ScriptedExchange),
}

impl TransportBackend {
    async fn exchange(&self, call: &PreparedCall) -> Result<RawReply, TransportError> {
        match self {
            Self::Http { control, inference } => {
                let client = match call.endpoint {
                    Endpoint::Control => control,
                    Endpoint::Inference => inference,
                };
                exchange_http(client, call).await
            }
            #[cfg(any(test, feature = "test-support"))]
            Self::Scripted(exchange) => exchange.exchange(call).await,
        }
    }
}

#[derive(Clone)]
pub struct RequestTransport {
    control_base_url: Arc<str>,
    inference_base_url: Arc<str>,
    credential: Credential,
    activity: ActivitySignal,
    backend: TransportBackend,
}

impl RequestTransport {
    pub fn http(settings: &ControllerSettings, credential: Credential) -> Result<Self, TransportError> {
        let control = build_client(settings.request_timeout(), settings.control_timeout())?;
        let inference = build_client(settings.request_timeout(), settings.request_timeout())?;
        Ok(Self::with_backend(
            settings,
            credential,
            TransportBackend::Http { control, inference },
        ))
    }

    #[cfg(any(test, feature = "test-support"))]
    pub fn scripted(
        settings: &ControllerSettings,
        credential: Credential,
        exchange: ScriptedExchange,
    ) -> Self {
        Self::with_backend(settings, credential, TransportBackend::Scripted(exchange))
    }

    fn with_backend(
        settings: &ControllerSettings,
        credential: Credential,
        backend: TransportBackend,
    ) -> Self {
        Self {
            control_base_url: Arc::from(settings.control_base_url.as_str()),
            inference_base_url: Arc::from(settings.inference_base_url.as_str()),
            credential,
            activity: ActivitySignal::new(),
            backend,
        }
    }

    pub fn activity(&self) -> &ActivitySignal {
        &self.activity
    }

    /// Absolute URL for `request`, without its query pairs.
    pub fn url_for(&self, request: &TransportRequest) -> Result<Url, TransportError> {
        self.resolve(request).map(|(url, _)| url)
    }

    pub async fn call(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let (url, route) = self.resolve(&request)?;
        debug!(method = request.method.as_str(), %url, "transport call");

        let call = PreparedCall {
            method: request.method,
            endpoint: request.endpoint,
            url,
            route,
            query: request.query,
            accept: match request.response_kind {
                ResponseKind::Json => "application/json",
                ResponseKind::Binary => "application/octet-stream, application/json",
            },
            authorization: self.credential.authorization_header(),
            body: request.body,
        };
        let reply = self.backend.exchange(&call).await?;

        if !(200..300).contains(&reply.status) {
            debug!(
                method = call.method.as_str(),
                route = %call.route,
                status = reply.status,
                "transport call rejected"
            );
            return Err(TransportError::HttpStatus(reply.status));
        }
        if request.marks_activity {
            self.activity.raise();
        }

        let data = decode_body(reply.body, request.response_kind)?;
        Ok(TransportResponse {
            status: reply.status,
            content_type: reply.content_type,
            data,
        })
    }

    fn resolve(&self, request: &TransportRequest) -> Result<(Url, String), TransportError> {
        let base = match request.endpoint {
            Endpoint::Control => &self.control_base_url,
            Endpoint::Inference => &self.inference_base_url,
        };
        let mut url = Url::parse(base)
            .map_err(|err| TransportError::InvalidUrl(format!("{base}: {err}")))?;
        let base_path = url.path().trim_end_matches('/').to_string();
        url.path_segments_mut()
            .map_err(|_| TransportError::InvalidUrl(format!("{base} cannot carry a path")))?
            .pop_if_empty()
            .extend(request.path.split('/').filter(|segment| !segment.is_empty()))
            .extend(&request.segments);

        let route = url
            .path()
            .strip_prefix(base_path.as_str())
            .unwrap_or(url.path())
            .trim_start_matches('/')
            .to_string();
        Ok((url, route))
    }
}

fn build_client(
    connect_timeout: std::time::Duration,
    timeout: std::time::Duration,
) -> Result<reqwest::Client, TransportError> {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|err| TransportError::Setup(format!("failed to build HTTP client: {err}")))
}

fn decode_body(body: Vec<u8>, kind: ResponseKind) -> Result<ResponseData, TransportError> {
    match kind {
        ResponseKind::Binary => Ok(ResponseData::Binary(body)),
        ResponseKind::Json if body.iter().all(u8::is_ascii_whitespace) => {
            Ok(ResponseData::Json(Value::Null))
        }
        ResponseKind::Json => serde_json::from_slice(&body)
            .map(ResponseData::Json)
            .map_err(|err| TransportError::Decode(err.to_string())),
    }
}

async fn exchange_http(
    client: &reqwest::Client,
    call: &PreparedCall,
) -> Result<RawReply, TransportError> {
    let method = match call.method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Delete => reqwest::Method::DELETE,
    };
    let mut authorization = HeaderValue::from_str(&call.authorization)
        .map_err(|_| TransportError::Setup("credential is not a valid header value".to_string()))?;
    authorization.set_sensitive(true);

    let mut request = client
        .request(method, call.url.clone())
        .header(AUTHORIZATION, authorization)
        .header(ACCEPT, call.accept);
    if !call.query.is_empty() {
        request = request.query(&call.query);
    }
    request = match &call.body {
        Some(RequestBody::Json(value)) => request.json(value),
        Some(RequestBody::Form(form)) => request.multipart(form.to_reqwest()?),
        None => request,
    };

    let response = request
        .send()
        .await
        .map_err(|err| TransportError::Network(err.to_string()))?;
    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string);
    let body = response
        .bytes()
        .await
        .map_err(|err| TransportError::Network(format!("failed to read response body: {err}")))?;
    Ok(RawReply {
        status,
        content_type,
        body: body.to_vec(),
    })
}
