//! Upload validation module
//!
//! Checks applied to each identity document image while the multipart body is
//! read, before anything reaches the engine.

use crate::error::ApiError;

/// Validates the Content-Type of an uploaded image against the allowed list.
///
/// Parameters such as `; charset=` are ignored and matching is case-insensitive.
/// A missing Content-Type is rejected.
pub fn validate_content_type(content_type: Option<&str>, allowed: &[String]) -> Result<(), ApiError> {
    let Some(ct) = content_type else {
        return Err(ApiError::bad_request(
            "Image part is missing a Content-Type header",
        ));
    };

    let essence = ct.split(';').next().unwrap_or_default().trim().to_lowercase();
    if allowed.iter().any(|a| a.eq_ignore_ascii_case(&essence)) {
        Ok(())
    } else {
        Err(ApiError::bad_request(format!(
            "Unsupported Content-Type: '{}'. Allowed types: {}",
            ct,
            allowed.join(", ")
        )))
    }
}

/// Validates the size of an uploaded image
pub fn validate_file_size(size: usize, max_size: usize) -> Result<(), ApiError> {
    if size == 0 {
        return Err(ApiError::bad_request("Image is empty"));
    }
    if size > max_size {
        Err(ApiError::bad_request(format!(
            "Image too large: {} bytes exceeds maximum of {} bytes",
            size, max_size
        )))
    } else {
        Ok(())
    }
}

/// Validates how many images one submission carries
pub fn validate_image_count(count: usize, max_images: usize) -> Result<(), ApiError> {
    if count > max_images {
        Err(ApiError::bad_request(format!(
            "Too many images: at most {max_images} may be submitted"
        )))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed() -> Vec<String> {
        vec!["image/jpeg".into(), "image/png".into()]
    }

    #[test]
    fn test_validate_content_type_allowed() {
        assert!(validate_content_type(Some("image/jpeg"), &allowed()).is_ok());
        assert!(validate_content_type(Some("IMAGE/PNG"), &allowed()).is_ok());
        assert!(validate_content_type(Some("image/jpeg; q=0.9"), &allowed()).is_ok());
    }

    #[test]
    fn test_validate_content_type_rejected() {
        assert!(validate_content_type(Some("image/gif"), &allowed()).is_err());
        assert!(validate_content_type(Some("application/pdf"), &allowed()).is_err());
        assert!(validate_content_type(None, &allowed()).is_err());
    }

    #[test]
    fn test_validate_file_size() {
        let max = 10 * 1024 * 1024;
        assert!(validate_file_size(1024, max).is_ok());
        assert!(validate_file_size(max, max).is_ok());
        assert!(validate_file_size(max + 1, max).is_err());
        assert!(validate_file_size(0, max).is_err());
    }

    #[test]
    fn test_validate_image_count() {
        assert!(validate_image_count(4, 4).is_ok());
        assert!(validate_image_count(5, 4).is_err());
    }
}
