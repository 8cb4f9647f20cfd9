//! Contains the data models for API requests and responses.

use serde::{Deserialize, Serialize};

/// Body of `POST /api/v1/cancel`.
#[derive(Debug, Deserialize, Serialize)]
pub struct CancelRequest {
    pub job_id: String,
}

/// Body of `GET /connection`.
#[derive(Debug, Deserialize, Serialize)]
pub struct ConnectionResponse {
    /// `"ok"` or `"not ready"`.
    pub value: String,
    pub tweaker_available: bool,
    pub slicer_available: bool,
}

/// Profile passed with a pipeline request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileField {
    /// A file part, saved into the profiles directory.
    Upload { file_name: String, content: Vec<u8> },
    /// Name of a stored profile, or `no_slicing`.
    Named(String),
}

/// Fields of the multipart pipeline submission.
#[derive(Debug, Default)]
pub struct PipelineForm {
    /// File name and bytes of the `model` part.
    pub model: Option<(String, Vec<u8>)>,
    pub profile: Option<ProfileField>,
    pub tweak_option: Option<String>,
    pub machinecode_name: Option<String>,
    pub octoprint_url: Option<String>,
    pub apikey: Option<String>,
    pub request_source: Option<String>,
}

impl PipelineForm {
    /// Store a text field; unknown names are ignored. Empty values count as absent.
    pub fn set_text(&mut self, name: &str, value: String) {
        let value = Some(value).filter(|v| !v.trim().is_empty());
        match name {
            "tweak_option" => self.tweak_option = value,
            "machinecode_name" => self.machinecode_name = value,
            "octoprint_url" => self.octoprint_url = value,
            "apikey" => self.apikey = value,
            "request_source" => self.request_source = value,
            "profile" => self.profile = value.map(ProfileField::Named),
            other => tracing::debug!("Ignoring unknown form field '{}'", other),
        }
    }

    pub fn from_octoprint(&self) -> bool {
        self.request_source.as_deref() == Some("octoprint")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_text_fields() {
        let mut form = PipelineForm::default();
        form.set_text("tweak_option", "tweak_keep".to_string());
        form.set_text("profile", "fine.ini".to_string());
        form.set_text("machinecode_name", "".to_string());
        form.set_text("request_source", "octoprint".to_string());
        form.set_text("unknown", "x".to_string());
        assert_eq!(form.tweak_option.as_deref(), Some("tweak_keep"));
        assert_eq!(form.profile, Some(ProfileField::Named("fine.ini".to_string())));
        assert_eq!(form.machinecode_name, None);
        assert!(form.from_octoprint());
    }
}
