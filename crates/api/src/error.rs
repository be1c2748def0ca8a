//! Error taxonomy of the remote store.

/// Errors produced while talking to the remote store or touching local
/// storage on its behalf.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EndpointError {
    /// Connectivity problem or timeout.
    #[error("network error: {0}")]
    Network(String),

    /// Non-2xx response.
    #[error("{}", server_message(.code, .message))]
    Server { code: u16, message: String },

    /// Response body could not be interpreted.
    #[error("protocol error: {reason}")]
    Protocol { reason: String, body: String },

    /// Local destination missing, not writable, or failed mid-write.
    #[error("destination unwritable: {0}")]
    DestinationUnwritable(String),

    /// Local upload source could not be read.
    #[error("source unreadable: {0}")]
    SourceUnreadable(String),
}

impl EndpointError {
    /// Builds a protocol error, keeping at most 500 bytes of the body.
    pub fn protocol(reason: impl Into<String>, body: &str) -> Self {
        Self::Protocol {
            reason: reason.into(),
            body: preview(body, 500),
        }
    }

    /// HTTP status code for server errors.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Server { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for EndpointError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return Self::protocol(e.to_string(), "");
        }
        if let Some(status) = e.status() {
            return Self::Server {
                code: status.as_u16(),
                message: e.to_string(),
            };
        }
        Self::Network(e.to_string())
    }
}

/// User-facing text for a non-success status.
///
/// 413 and 503 get friendlier wording; handling is identical.
fn server_message(code: &u16, message: &str) -> String {
    match *code {
        413 => "file exceeds the server's size limit (HTTP 413)".into(),
        503 => "server temporarily unavailable, try again later (HTTP 503)".into(),
        _ if message.is_empty() => format!("server error (HTTP {code})"),
        _ => format!("server error (HTTP {code}): {message}"),
    }
}

/// Truncates `s` to at most `max` bytes on a char boundary.
pub(crate) fn preview(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn friendly_text_for_413_and_503() {
        let e = EndpointError::Server {
            code: 413,
            message: "Request Entity Too Large".into(),
        };
        assert!(e.to_string().contains("size limit"));

        let e = EndpointError::Server {
            code: 503,
            message: String::new(),
        };
        assert!(e.to_string().contains("temporarily unavailable"));
    }

    #[test]
    fn generic_server_text_includes_code_and_message() {
        let e = EndpointError::Server {
            code: 404,
            message: "file not found".into(),
        };
        assert_eq!(e.to_string(), "server error (HTTP 404): file not found");
        assert_eq!(e.status_code(), Some(404));
    }

    #[test]
    fn protocol_body_is_truncated() {
        let body = "x".repeat(2000);
        match EndpointError::protocol("bad json", &body) {
            EndpointError::Protocol { body, .. } => assert_eq!(body.len(), 500),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn preview_respects_char_boundaries() {
        let s = "文件列表";
        let p = preview(s, 4);
        assert_eq!(p, "文");
    }
}
