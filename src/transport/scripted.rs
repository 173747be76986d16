use super::{Endpoint, HttpMethod, PreparedCall, RawReply, RequestBody, TransportError};
use serde_json::Value;
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedReply {
    Respond {
        status: u16,
        content_type: Option<String>,
        body: Vec<u8>,
        latency: Option<Duration>,
    },
    NetworkFailure(String),
}

impl ScriptedReply {
    pub fn json(status: u16, value: Value) -> Self {
        Self::Respond {
            status,
            content_type: Some("application/json".to_string()),
            body: value.to_string().into_bytes(),
            latency: None,
        }
    }

    pub fn ok_json(value: Value) -> Self {
        Self::json(200, value)
    }

    pub fn binary(status: u16, body: Vec<u8>) -> Self {
        Self::Respond {
            status,
            content_type: Some("application/octet-stream".to_string()),
            body,
            latency: None,
        }
    }

    pub fn status(status: u16) -> Self {
        Self::Respond {
            status,
            content_type: None,
            body: Vec::new(),
            latency: None,
        }
    }

    pub fn network_failure(reason: impl Into<String>) -> Self {
        Self::NetworkFailure(reason.into())
    }

    pub fn with_latency(self, delay: Duration) -> Self {
        match self {
            Self::Respond {
                status,
                content_type,
                body,
                ..
            } => Self::Respond {
                status,
                content_type,
                body,
                latency: Some(delay),
            },
            other => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub method: HttpMethod,
    pub endpoint: Endpoint,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub authorization: String,
    pub body: Option<RequestBody>,
}

#[derive(Debug, Default)]
struct ScriptState {
    routes: HashMap<(HttpMethod, String), VecDeque<ScriptedReply>>,
    calls: Vec<RecordedCall>,
}

/// In-process replacement for the HTTP backend. Replies are queued per
/// method and encoded path; the last reply of a route keeps answering once
/// the queue drains to it.
#[derive(Debug, Clone, Default)]
pub struct ScriptedExchange {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, method: HttpMethod, path: impl Into<String>, reply: ScriptedReply) {
        self.lock()
            .routes
            .entry((method, path.into()))
            .or_default()
            .push_back(reply);
    }

    /// Drops any queued replies for the route and installs `reply`.
    pub fn replace(&self, method: HttpMethod, path: impl Into<String>, reply: ScriptedReply) {
        let mut queue = VecDeque::new();
        queue.push_back(reply);
        self.lock().routes.insert((method, path.into()), queue);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, method: HttpMethod, path: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.method == method && call.path == path)
            .count()
    }

    pub(crate) async fn exchange(&self, call: &PreparedCall) -> Result<RawReply, TransportError> {
        let reply = {
            let mut state = self.lock();
            state.calls.push(RecordedCall {
                method: call.method,
                endpoint: call.endpoint,
                path: call.route.clone(),
                query: call.query.clone(),
                authorization: call.authorization.clone(),
                body: call.body.clone(),
            });
            let key = (call.method, call.route.clone());
            match state.routes.get_mut(&key) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };

        match reply {
            Some(ScriptedReply::Respond {
                status,
                content_type,
                body,
                latency,
            }) => {
                if let Some(delay) = latency {
                    tokio::time::sleep(delay).await;
                }
                Ok(RawReply {
                    status,
                    content_type,
                    body,
                })
            }
            Some(ScriptedReply::NetworkFailure(reason)) => Err(TransportError::Network(reason)),
            None => Err(TransportError::Network(format!(
                "no scripted reply for {} {}",
                call.method.as_str(),
                call.route
            ))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
