use super::TransportError;
use reqwest::multipart::{Form, Part};
use serde_json::Value;

const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormPart {
    pub name: String,
    pub file_name: Option<String>,
    pub data: Vec<u8>,
}

/// Parts of a `multipart/form-data` body. Kept as plain data so requests stay
/// comparable and cloneable; converted to a reqwest form only when sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultipartForm {
    parts: Vec<FormPart>,
}

impl MultipartForm {
    pub fn new() -> Self {
        Self::default()
    }

    /// The inference server expects request parameters as a JSON text part named `params`.
    pub fn with_params(params: &Value) -> Self {
        Self::new().text("params", params.to_string())
    }

    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parts.push(FormPart {
            name: name.into(),
            file_name: None,
            data: value.into().into_bytes(),
        });
        self
    }

    pub fn file(
        mut self,
        name: impl Into<String>,
        file_name: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        self.parts.push(FormPart {
            name: name.into(),
            file_name: Some(file_name.into()),
            data,
        });
        self
    }

    pub fn parts(&self) -> &[FormPart] {
        &self.parts
    }

    pub fn part(&self, name: &str) -> Option<&FormPart> {
        self.parts.iter().find(|part| part.name == name)
    }

    pub(crate) fn to_reqwest(&self) -> Result<Form, TransportError> {
        let mut form = Form::new();
        for part in &self.parts {
            let body = Part::bytes(part.data.clone());
            let body = match &part.file_name {
                Some(file_name) => body
                    .file_name(file_name.clone())
                    .mime_str(OCTET_STREAM)
                    .map_err(|err| TransportError::Setup(format!("invalid part type: {err}")))?,
                None => body,
            };
            form = form.part(part.name.clone(), body);
        }
        Ok(form)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn params_part_carries_json_text() {
        let form = MultipartForm::with_params(&json!({"label_info": []}))
            .file("label", "label.bin", vec![1, 2, 3]);

        let params = form.part("params").expect("params part");
        assert_eq!(params.file_name, None);
        assert_eq!(params.data, br#"{"label_info":[]}"#.to_vec());
        let label = form.part("label").expect("label part");
        assert_eq!(label.file_name.as_deref(), Some("label.bin"));
    }

    #[test]
    fn reqwest_form_uses_a_boundary() {
        let form = MultipartForm::with_params(&json!({}))
            .file("label", "label.bin", vec![9])
            .to_reqwest()
            .expect("form should convert");
        assert!(!form.boundary().is_empty());
    }

    #[test]
    fn part_lookup_by_name() {
        let form = MultipartForm::new().text("params", "{}").file("label", "l.bin", vec![9]);
        assert_eq!(form.parts().len(), 2);
        assert_eq!(form.part("label").map(|part| part.data.clone()), Some(vec![9]));
        assert!(form.part("missing").is_none());
    }
}
