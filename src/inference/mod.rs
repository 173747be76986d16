use crate::transport::{
    Endpoint, MultipartForm, RequestTransport, ResponseKind, TransportError, TransportRequest,
};
use serde_json::{json, Map, Value};

pub const DEFAULT_RESULT_EXTENSION: &str = ".nrrd";
const RESULT_DTYPE: &str = "uint16";
const LABEL_FILE_NAME: &str = "label.bin";

pub type InferParams = Map<String, Value>;

/// Voxel coordinate used by deepgrow clicks.
pub type Point = [i64; 3];

#[derive(Debug, Clone, PartialEq)]
pub struct InferenceOutput {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Typed calls against the inference server. Every successful call counts
/// as instance activity through the shared transport.
#[derive(Clone)]
pub struct InferenceClient {
    transport: RequestTransport,
}

impl InferenceClient {
    pub fn new(transport: RequestTransport) -> Self {
        Self { transport }
    }

    pub async fn info(&self) -> Result<Value, TransportError> {
        self.transport
            .call(TransportRequest::get(Endpoint::Inference, "info"))
            .await?
            .into_json()
    }

    pub async fn infer(
        &self,
        model: &str,
        image: &str,
        mut params: InferParams,
        label: Option<Vec<u8>>,
        result_extension: Option<&str>,
    ) -> Result<InferenceOutput, TransportError> {
        if let Some(extension) = result_extension {
            params.insert("result_extension".to_string(), json!(extension));
            params.insert("result_dtype".to_string(), json!(RESULT_DTYPE));
            params.insert("result_compress".to_string(), json!(false));
        }

        let mut form = MultipartForm::with_params(&Value::Object(params));
        if let Some(label) = label {
            form = form.file("label", LABEL_FILE_NAME, label);
        }

        let response = self
            .transport
            .call(
                TransportRequest::post(Endpoint::Inference, "infer")
                    .segment(model)
                    .query("image", image)
                    .query("output", "image")
                    .form(form)
                    .response(ResponseKind::Binary),
            )
            .await?;
        Ok(InferenceOutput {
            content_type: response.content_type.clone(),
            bytes: response.into_bytes(),
        })
    }

    /// `label` carries an optional scribble volume used by the model.
    pub async fn segmentation(
        &self,
        model: &str,
        image: &str,
        params: InferParams,
        label: Option<Vec<u8>>,
    ) -> Result<InferenceOutput, TransportError> {
        self.infer(model, image, params, label, Some(DEFAULT_RESULT_EXTENSION))
            .await
    }

    pub async fn deepgrow(
        &self,
        model: &str,
        image: &str,
        foreground: &[Point],
        background: &[Point],
        mut params: InferParams,
    ) -> Result<InferenceOutput, TransportError> {
        params.insert("foreground".to_string(), json!(foreground));
        params.insert("background".to_string(), json!(background));
        self.infer(model, image, params, None, Some(DEFAULT_RESULT_EXTENSION))
            .await
    }

    pub async fn next_sample(
        &self,
        strategy: &str,
        params: Value,
    ) -> Result<Value, TransportError> {
        self.transport
            .call(
                TransportRequest::post(Endpoint::Inference, "activelearning")
                    .segment(strategy)
                    .json(params),
            )
            .await?
            .into_json()
    }

    pub async fn save_label(
        &self,
        image: &str,
        label: Vec<u8>,
        params: &Value,
    ) -> Result<Value, TransportError> {
        let form = MultipartForm::with_params(params).file("label", LABEL_FILE_NAME, label);
        self.transport
            .call(
                TransportRequest::put(Endpoint::Inference, "datastore/label")
                    .query("image", image)
                    .form(form),
            )
            .await?
            .into_json()
    }

    pub async fn is_train_running(&self) -> Result<bool, TransportError> {
        let response = self
            .transport
            .call(
                TransportRequest::get(Endpoint::Inference, "train")
                    .query("check_if_running", "true"),
            )
            .await?;
        let running = response.status == 200
            && response
                .json()
                .and_then(|body| body.get("status"))
                .and_then(Value::as_str)
                == Some("RUNNING");
        Ok(running)
    }

    pub async fn run_train(&self, params: Value) -> Result<Value, TransportError> {
        self.transport
            .call(TransportRequest::post(Endpoint::Inference, "train").json(params))
            .await?
            .into_json()
    }

    pub async fn stop_train(&self) -> Result<Value, TransportError> {
        self.transport
            .call(TransportRequest::delete(Endpoint::Inference, "train"))
            .await?
            .into_json()
    }
}
