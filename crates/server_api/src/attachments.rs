use base64::{engine::general_purpose::STANDARD, Engine as _};
use shared::{
    domain::ConversationId,
    protocol::{AttachmentFailure, AttachmentUpload},
};
use storage::{NewAttachment, ObjectStore};
use tracing::warn;
use uuid::Uuid;

pub const MAX_ATTACHMENT_BYTES: usize = 8 * 1024 * 1024;
pub const MAX_FILENAME_BYTES: usize = 180;
const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedAttachment {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Decodes and checks one upload. The error is a human-readable reason.
pub fn validate_attachment(
    upload: &AttachmentUpload,
    max_bytes: usize,
) -> Result<DecodedAttachment, String> {
    let filename = upload.filename.trim();
    if filename.is_empty() {
        return Err("filename is required".into());
    }
    if filename.len() > MAX_FILENAME_BYTES {
        return Err("filename is too long".into());
    }
    if filename.contains('/') || filename.contains('\\') {
        return Err("filename must not contain path separators".into());
    }

    let bytes = STANDARD
        .decode(upload.data_b64.trim())
        .map_err(|_| "attachment is not valid base64".to_string())?;
    if bytes.is_empty() {
        return Err("attachment body cannot be empty".into());
    }
    if bytes.len() > max_bytes {
        return Err(format!("attachment exceeds {max_bytes} bytes"));
    }

    Ok(DecodedAttachment {
        filename: filename.to_string(),
        mime_type: upload
            .mime_type
            .as_deref()
            .map(str::trim)
            .filter(|mime| !mime.is_empty())
            .map(str::to_string),
        bytes,
    })
}

/// Validates and uploads every attachment independently. Whatever fails is reported
/// back instead of aborting the others.
pub async fn upload_attachments(
    objects: &dyn ObjectStore,
    conversation_id: ConversationId,
    uploads: &[AttachmentUpload],
    max_bytes: usize,
) -> (Vec<NewAttachment>, Vec<AttachmentFailure>) {
    let mut stored = Vec::with_capacity(uploads.len());
    let mut failed = Vec::new();

    for upload in uploads {
        let decoded = match validate_attachment(upload, max_bytes) {
            Ok(decoded) => decoded,
            Err(reason) => {
                warn!(%conversation_id, filename = %upload.filename, %reason, "attachment rejected");
                failed.push(AttachmentFailure {
                    filename: upload.filename.clone(),
                    reason,
                });
                continue;
            }
        };

        let storage_path = format!("conversations/{}/{}", conversation_id.0, Uuid::new_v4());
        let content_type = decoded.mime_type.as_deref().unwrap_or(DEFAULT_MIME_TYPE);
        match objects
            .put_object(&storage_path, content_type, &decoded.bytes)
            .await
        {
            Ok(url) => stored.push(NewAttachment {
                storage_path,
                url,
                filename: decoded.filename,
                mime_type: decoded.mime_type,
                size_bytes: decoded.bytes.len() as u64,
            }),
            Err(error) => {
                warn!(%conversation_id, filename = %decoded.filename, %error, "attachment upload failed");
                failed.push(AttachmentFailure {
                    filename: decoded.filename,
                    reason: "upload failed".into(),
                });
            }
        }
    }

    (stored, failed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(filename: &str, data: &[u8]) -> AttachmentUpload {
        AttachmentUpload {
            filename: filename.into(),
            mime_type: Some("text/plain".into()),
            data_b64: STANDARD.encode(data),
        }
    }

    #[test]
    fn accepts_reasonable_attachment() {
        let decoded = validate_attachment(&upload("notes.txt", b"hello"), 16).expect("valid");
        assert_eq!(decoded.bytes, b"hello");
        assert_eq!(decoded.mime_type.as_deref(), Some("text/plain"));
    }

    #[test]
    fn rejects_bad_attachments() {
        assert!(validate_attachment(&upload("big.bin", &[0u8; 17]), 16).is_err());
        assert!(validate_attachment(&upload("empty.bin", b""), 16).is_err());
        assert!(validate_attachment(&upload("../x.txt", b"x"), 16).is_err());
        assert!(validate_attachment(&upload(&"a".repeat(181), b"x"), 16).is_err());

        let mut garbled = upload("x.txt", b"x");
        garbled.data_b64 = "***".into();
        assert!(validate_attachment(&garbled, 16).is_err());
    }
}
