//! Multipart form parsing helpers
//!
//! Document submissions arrive as multipart/form-data: one or more `image`
//! file parts plus `document_type` and an optional `metadata` JSON field.

use std::collections::HashMap;

use axum::extract::Multipart;
use idproof_core::{DocumentImage, UploadLimits};
use serde::de::DeserializeOwned;

use crate::error::ApiError;
use crate::validation::{validate_content_type, validate_file_size, validate_image_count};

/// Name of the repeated file part
pub const IMAGE_FIELD: &str = "image";

/// Represents a file uploaded via multipart form
#[derive(Clone)]
pub struct FileField {
    pub data: Vec<u8>,
    pub content_type: Option<String>,
    pub file_name: Option<String>,
}

impl std::fmt::Debug for FileField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileField")
            .field("len", &self.data.len())
            .field("content_type", &self.content_type)
            .field("file_name", &self.file_name)
            .finish()
    }
}

impl From<FileField> for DocumentImage {
    fn from(file: FileField) -> Self {
        DocumentImage {
            content_type: file.content_type.unwrap_or_default(),
            data: file.data,
        }
    }
}

/// Parsed multipart form fields
#[derive(Debug, Default)]
pub struct MultipartFields {
    files: Vec<FileField>,
    text_fields: HashMap<String, String>,
}

impl MultipartFields {
    /// Parse all fields, validating every image part against `limits` as it is read.
    pub async fn parse(multipart: &mut Multipart, limits: &UploadLimits) -> Result<Self, ApiError> {
        let mut fields = Self::default();

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::bad_request(format!("Failed to parse multipart: {}", e)))?
        {
            let name = field.name().unwrap_or("").to_string();

            if name == IMAGE_FIELD {
                validate_image_count(fields.files.len() + 1, limits.max_images)?;

                let content_type = field.content_type().map(|s| s.to_string());
                let file_name = field.file_name().map(|s| s.to_string());
                validate_content_type(content_type.as_deref(), &limits.allowed_content_types)?;

                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Failed to read image: {}", e)))?
                    .to_vec();
                validate_file_size(data.len(), limits.max_image_bytes)?;

                fields.files.push(FileField {
                    data,
                    content_type,
                    file_name,
                });
            } else {
                let value = field.text().await.map_err(|e| {
                    ApiError::bad_request(format!("Failed to read field '{}': {}", name, e))
                })?;
                fields.text_fields.insert(name, value);
            }
        }

        Ok(fields)
    }

    /// Take the uploaded images, failing if there are none.
    pub fn take_images(&mut self) -> Result<Vec<DocumentImage>, ApiError> {
        if self.files.is_empty() {
            return Err(ApiError::bad_request(format!(
                "No image provided. Use one or more '{IMAGE_FIELD}' fields in the multipart form."
            )));
        }
        Ok(std::mem::take(&mut self.files)
            .into_iter()
            .map(DocumentImage::from)
            .collect())
    }

    pub fn get_text(&self, name: &str) -> Option<&str> {
        self.text_fields.get(name).map(|s| s.as_str())
    }

    /// Required text field, trimmed.
    pub fn require_text(&self, name: &str) -> Result<&str, ApiError> {
        self.get_text(name)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApiError::bad_request(format!("Missing '{name}' field")))
    }

    /// Get a text field parsed as JSON
    ///
    /// Returns `Ok(None)` if the field is missing or empty.
    pub fn get_json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, ApiError> {
        match self.text_fields.get(name) {
            Some(json) if !json.trim().is_empty() => {
                let value: T = serde_json::from_str(json)
                    .map_err(|e| ApiError::bad_request(format!("Invalid {} JSON: {}", name, e)))?;
                Ok(Some(value))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_text(pairs: &[(&str, &str)]) -> MultipartFields {
        MultipartFields {
            files: Vec::new(),
            text_fields: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_require_text() {
        let fields = with_text(&[("document_type", " PASSPORT "), ("blank", "  ")]);
        assert_eq!(fields.require_text("document_type").unwrap(), "PASSPORT");
        assert!(fields.require_text("blank").is_err());
        assert!(fields.require_text("missing").is_err());
    }

    #[test]
    fn test_get_json() {
        let fields = with_text(&[("metadata", r#"{"country":"FR"}"#), ("bad", "{nope"), ("empty", "")]);
        let value: serde_json::Value = fields.get_json("metadata").unwrap().unwrap();
        assert_eq!(value["country"], "FR");
        assert!(fields.get_json::<serde_json::Value>("bad").is_err());
        assert!(fields.get_json::<serde_json::Value>("empty").unwrap().is_none());
    }

    #[test]
    fn test_take_images_requires_one() {
        let mut fields = with_text(&[]);
        assert!(fields.take_images().is_err());

        fields.files.push(FileField {
            data: vec![0xFF, 0xD8],
            content_type: Some("image/jpeg".into()),
            file_name: Some("front.jpg".into()),
        });
        let images = fields.take_images().unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].content_type, "image/jpeg");
    }
}
