use crate::{
    settings::ControllerSettings,
    transport::{Endpoint, RequestTransport, TransportError, TransportRequest},
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceIdentity {
    zone: String,
    name: String,
}

impl InstanceIdentity {
    pub fn new(zone: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            zone: zone.into(),
            name: name.into(),
        }
    }

    pub fn from_settings(settings: &ControllerSettings) -> Self {
        Self::new(settings.instance_zone.trim(), settings.instance_name.trim())
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    pub status: u16,
    pub body: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceAction {
    Start,
    Stop,
}

impl InstanceAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
        }
    }
}

#[derive(Clone)]
pub struct InstanceControlClient {
    transport: RequestTransport,
}

impl InstanceControlClient {
    pub fn new(transport: RequestTransport) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &RequestTransport {
        &self.transport
    }

    pub async fn is_running(&self, identity: &InstanceIdentity) -> Result<bool, TransportError> {
        let body = self
            .transport
            .call(
                TransportRequest::get(Endpoint::Control, "is_running")
                    .segment(identity.zone())
                    .segment(identity.name()),
            )
            .await?
            .into_json()?;
        match data_field(&body)? {
            Value::Bool(running) => Ok(*running),
            other => Err(TransportError::Decode(format!(
                "expected boolean running state, got {other}"
            ))),
        }
    }

    pub async fn start(&self, identity: &InstanceIdentity) -> Result<Ack, TransportError> {
        self.mutate(InstanceAction::Start, identity).await
    }

    pub async fn stop(&self, identity: &InstanceIdentity) -> Result<Ack, TransportError> {
        self.mutate(InstanceAction::Stop, identity).await
    }

    pub async fn toggle(
        &self,
        currently_running: bool,
        identity: &InstanceIdentity,
    ) -> Result<Ack, TransportError> {
        if currently_running {
            self.stop(identity).await
        } else {
            self.start(identity).await
        }
    }

    /// Authoritative seconds of inactivity as tracked by the router.
    pub async fn fetch_elapsed_inactivity(&self) -> Result<u64, TransportError> {
        let body = self
            .transport
            .call(TransportRequest::get(Endpoint::Control, "timer_elapsed"))
            .await?
            .into_json()?;
        let data = data_field(&body)?;
        data.as_u64()
            .or_else(|| {
                data.as_f64()
                    .filter(|secs| secs.is_finite() && *secs >= 0.0)
                    .map(|secs| secs.round() as u64)
            })
            .ok_or_else(|| {
                TransportError::Decode(format!("expected non-negative seconds, got {data}"))
            })
    }

    async fn mutate(
        &self,
        action: InstanceAction,
        identity: &InstanceIdentity,
    ) -> Result<Ack, TransportError> {
        let response = self
            .transport
            .call(
                TransportRequest::post(Endpoint::Control, action.as_str()).json(json!({
                    "instanceZone": identity.zone(),
                    "instanceName": identity.name(),
                })),
            )
            .await?;
        let status = response.status;
        Ok(Ack {
            status,
            body: response.into_json()?,
        })
    }
}

fn data_field(body: &Value) -> Result<&Value, TransportError> {
    body.get("data")
        .ok_or_else(|| TransportError::Decode("response has no `data` field".to_string()))
}
