use crate::error::CoreError;

/// Identifier of a document as assigned by the server.
pub type DocumentId = String;

/// Identifier of a backend job. Compilation jobs reuse the document id.
pub type JobId = String;

/// Identifier of a saved document version (backup).
pub type VersionId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Check that an identifier can be used as a single URL path segment.
pub fn validate_id(kind: &str, value: &str) -> Result<(), CoreError> {
    if value.trim().is_empty() {
        return Err(CoreError::Validation(format!("{kind} must not be empty")));
    }
    if value.contains(['/', '?', '#']) || value.chars().any(char::is_whitespace) {
        return Err(CoreError::Validation(format!(
            "{kind} '{value}' contains characters not allowed in a path segment"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_ids() {
        assert!(validate_id("document id", "doc-1").is_ok());
        assert!(validate_id("version id", "20260102T030405").is_ok());
    }

    #[test]
    fn rejects_empty_and_path_like_ids() {
        assert!(validate_id("document id", "  ").is_err());
        assert!(validate_id("document id", "../etc").is_err());
        assert!(validate_id("document id", "a b").is_err());
    }
}
