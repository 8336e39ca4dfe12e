//! Outbound calls to the AI inference services.
//!
//! Each stage makes exactly one multipart POST per attempt and receives a
//! JSON object back. The [`InferenceClient`] trait is the seam between the
//! handlers and the transport; [`HttpInferenceClient`] is the reqwest
//! implementation.

#[cfg(feature = "http")]
mod http;

#[cfg(feature = "http")]
pub use http::HttpInferenceClient;

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

use crate::cancellation::CancellationToken;
use crate::errors::Result;
use crate::stages::ResponseEnvelope;

/// One field of a multipart form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormPart {
    /// A plain text field.
    Text {
        /// Field name.
        name: String,
        /// Field value.
        value: String,
    },
    /// A file upload read from disk when the request is sent.
    File {
        /// Field name.
        name: String,
        /// Location of the file.
        path: PathBuf,
        /// File name reported to the service.
        file_name: String,
    },
}

impl FormPart {
    /// Field name of the part.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Text { name, .. } | Self::File { name, .. } => name,
        }
    }
}

/// A multipart form to POST to an inference endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InferenceRequest {
    parts: Vec<FormPart>,
}

impl InferenceRequest {
    /// Creates an empty form.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a text field.
    #[must_use]
    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parts.push(FormPart::Text {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    /// Adds a file field.
    #[must_use]
    pub fn file(
        mut self,
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        file_name: impl Into<String>,
    ) -> Self {
        self.parts.push(FormPart::File {
            name: name.into(),
            path: path.into(),
            file_name: file_name.into(),
        });
        self
    }

    /// All parts in insertion order.
    #[must_use]
    pub fn parts(&self) -> &[FormPart] {
        &self.parts
    }

    /// Value of a text field.
    #[must_use]
    pub fn text_value(&self, name: &str) -> Option<&str> {
        self.parts.iter().find_map(|part| match part {
            FormPart::Text { name: n, value } if n == name => Some(value.as_str()),
            _ => None,
        })
    }

    /// Path of a file field.
    #[must_use]
    pub fn file_path(&self, name: &str) -> Option<&PathBuf> {
        self.parts.iter().find_map(|part| match part {
            FormPart::File { name: n, path, .. } if n == name => Some(path),
            _ => None,
        })
    }
}

/// Transport to the inference services.
///
/// Implementations map transport failures, non-2xx responses, an expired
/// deadline and cancellation to `ExternalService` errors, including the
/// response body of a non-2xx answer in the message.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// POSTs `request` to `endpoint` and returns the JSON object answered.
    async fn post_multipart(
        &self,
        endpoint: &str,
        request: InferenceRequest,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<ResponseEnvelope>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = InferenceRequest::new()
            .text("user_id", "u-1")
            .text("category", "blouse")
            .file("cloth_front", "/data/f.jpg", "f.jpg");

        assert_eq!(request.parts().len(), 3);
        assert_eq!(request.text_value("category"), Some("blouse"));
        assert_eq!(request.text_value("missing"), None);
        assert_eq!(
            request.file_path("cloth_front"),
            Some(&PathBuf::from("/data/f.jpg"))
        );
        assert_eq!(request.parts()[2].name(), "cloth_front");
    }
}
