use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// What the viewer knows about the series currently on screen.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DisplaySetInfo {
    pub patient_id: String,
    pub study_instance_uid: String,
    pub series_instance_uid: String,
    pub display_set_instance_uid: String,
    pub image_ids: Vec<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("display set has no images")]
    NoImages,
    #[error("display set is missing {0}")]
    MissingField(&'static str),
}

/// Read-only identifiers for one viewing session.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    patient_id: String,
    study_instance_uid: String,
    series_instance_uid: String,
    display_set_instance_uid: String,
    image_ids_to_index: HashMap<String, usize>,
    number_of_frames: usize,
    session_key: String,
}

impl SessionContext {
    pub fn from_display_set(display_set: &DisplaySetInfo) -> Result<Self, SessionError> {
        for (field, value) in [
            ("patientId", &display_set.patient_id),
            ("studyInstanceUid", &display_set.study_instance_uid),
            ("seriesInstanceUid", &display_set.series_instance_uid),
        ] {
            if value.trim().is_empty() {
                return Err(SessionError::MissingField(field));
            }
        }
        if display_set.image_ids.is_empty() {
            return Err(SessionError::NoImages);
        }

        let mut image_ids_to_index = HashMap::with_capacity(display_set.image_ids.len());
        for (index, image_id) in display_set.image_ids.iter().enumerate() {
            image_ids_to_index.entry(image_id.clone()).or_insert(index);
        }

        let session_key = sha256_hex(&format!(
            "{}{}{}",
            display_set.patient_id, display_set.study_instance_uid, display_set.series_instance_uid
        ));

        Ok(Self {
            patient_id: display_set.patient_id.clone(),
            study_instance_uid: display_set.study_instance_uid.clone(),
            series_instance_uid: display_set.series_instance_uid.clone(),
            display_set_instance_uid: display_set.display_set_instance_uid.clone(),
            image_ids_to_index,
            number_of_frames: display_set.image_ids.len(),
            session_key,
        })
    }

    pub fn patient_id(&self) -> &str {
        &self.patient_id
    }

    pub fn study_instance_uid(&self) -> &str {
        &self.study_instance_uid
    }

    pub fn series_instance_uid(&self) -> &str {
        &self.series_instance_uid
    }

    pub fn display_set_instance_uid(&self) -> &str {
        &self.display_set_instance_uid
    }

    pub fn number_of_frames(&self) -> usize {
        self.number_of_frames
    }

    /// Stable per-series key for client-side storage.
    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    pub fn frame_index(&self, image_id: &str) -> Option<usize> {
        self.image_ids_to_index.get(image_id).copied()
    }
}

fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}
