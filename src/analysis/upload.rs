use crate::error::AppError;

pub const MAX_UPLOAD_BYTES: usize = 4 * 1024 * 1024;
pub const ALLOWED_MIME_TYPES: [&str; 3] = ["image/png", "image/jpeg", "image/webp"];

/// Lowercases, drops parameters and folds the common `image/jpg` alias.
pub fn normalize_mime_type(mime_type: &str) -> String {
    let essence = mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_lowercase();
    match essence.as_str() {
        "image/jpg" | "image/pjpeg" => "image/jpeg".to_string(),
        _ => essence,
    }
}

/// Size and type checks an upload must pass before it is encoded or sent
/// anywhere. Returns the normalized MIME type.
pub fn validate_upload(bytes: &[u8], mime_type: &str, max_bytes: usize) -> Result<String, AppError> {
    if bytes.len() > max_bytes {
        return Err(AppError::OversizedInput { size: bytes.len(), limit: max_bytes });
    }
    if bytes.is_empty() {
        return Err(AppError::InvalidInput("Please select an image file first.".to_string()));
    }
    let normalized = normalize_mime_type(mime_type);
    if !ALLOWED_MIME_TYPES.contains(&normalized.as_str()) {
        return Err(AppError::UnsupportedMediaType(mime_type.to_string()));
    }
    Ok(normalized)
}
