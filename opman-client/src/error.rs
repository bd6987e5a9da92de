use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("request failed ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ClientError {
    /// Map a non-success status and the body's best reason to an error.
    pub fn from_status(status: StatusCode, reason: Option<String>) -> Self {
        let message = reason.unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        });
        match status.as_u16() {
            401 => ClientError::Unauthorized,
            403 => ClientError::Forbidden,
            404 => ClientError::NotFound,
            code if status.is_server_error() => ClientError::Server {
                status: code,
                message,
            },
            code => ClientError::Api {
                status: code,
                message,
            },
        }
    }

    /// Short text suitable for showing to an operator.
    pub fn user_message(&self) -> String {
        match self {
            ClientError::Unauthorized => "Session expired. Please login again.".to_string(),
            ClientError::Forbidden => {
                "You do not have permission to perform this action.".to_string()
            }
            ClientError::NotFound => "Resource not found.".to_string(),
            ClientError::Server { .. } => "Server error. Please try again later.".to_string(),
            ClientError::Api { message, .. } if !message.trim().is_empty() => message.clone(),
            ClientError::Api { .. } | ClientError::InvalidResponse(_) => {
                "Request failed. Please try again.".to_string()
            }
            ClientError::Network(_) => "Network error. Please check your connection.".to_string(),
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ClientError::Unauthorized)
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ClientError::InvalidResponse(err.to_string())
        } else {
            ClientError::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classes_map_to_variants() {
        assert!(matches!(
            ClientError::from_status(StatusCode::UNAUTHORIZED, None),
            ClientError::Unauthorized
        ));
        assert!(matches!(
            ClientError::from_status(StatusCode::FORBIDDEN, None),
            ClientError::Forbidden
        ));
        assert!(matches!(
            ClientError::from_status(StatusCode::NOT_FOUND, None),
            ClientError::NotFound
        ));
        assert!(matches!(
            ClientError::from_status(StatusCode::BAD_GATEWAY, None),
            ClientError::Server { status: 502, .. }
        ));
        match ClientError::from_status(StatusCode::CONFLICT, Some("name taken".into())) {
            ClientError::Api { status, message } => {
                assert_eq!(status, 409);
                assert_eq!(message, "name taken");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn user_message_prefers_server_reason_for_other_statuses() {
        let err = ClientError::from_status(StatusCode::BAD_REQUEST, Some("bad cron".into()));
        assert_eq!(err.user_message(), "bad cron");
        let err = ClientError::from_status(StatusCode::INTERNAL_SERVER_ERROR, Some("npe".into()));
        assert_eq!(err.user_message(), "Server error. Please try again later.");
        assert_eq!(
            ClientError::Network("refused".into()).user_message(),
            "Network error. Please check your connection."
        );
    }
}
