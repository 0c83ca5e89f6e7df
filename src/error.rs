use std::time::Duration;

/// Error type returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum DominoError {
    /// A command was attempted without a ready connection.
    #[error("not connected to server")]
    NotConnected,
    /// Send or receive error reported by the underlying stream.
    #[error("transport error: {0}")]
    Transport(std::io::Error),
    /// The stream ended before a closing `</response>` was observed.
    #[error("connection closed before a complete response was received")]
    IncompleteFrame,
    /// The response document is not well-formed XML.
    #[error("malformed response document: {0}")]
    MalformedDocument(String),
    /// Well-formed response whose status is not `ok`.
    #[error("{}", protocol_text(.status, .message.as_deref()))]
    Protocol {
        /// Status text as sent by the server (empty when absent).
        status: String,
        /// Server-supplied explanation.
        message: Option<String>,
    },
    /// Submission contained no queries.
    #[error("no queries to execute")]
    EmptyInput,
    /// No response frame arrived within the command timeout.
    #[error("timed out after {0:?} waiting for response")]
    Timeout(Duration),
    /// The engine task is no longer running.
    #[error("engine stopped")]
    EngineStopped,
}

impl DominoError {
    /// Whether the shared stream can still pair requests with responses
    /// after this error. Fatal errors take the connection down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::IncompleteFrame | Self::Timeout(_)
        )
    }
}

fn protocol_text(status: &str, message: Option<&str>) -> String {
    match message {
        Some(message) if !message.is_empty() => message.to_owned(),
        _ => format!("server reported status '{status}'"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::DominoError;

    #[test]
    fn protocol_error_displays_server_message_verbatim() {
        let err = DominoError::Protocol {
            status: "error".to_owned(),
            message: Some("unknown relation: employes".to_owned()),
        };
        assert_eq!(err.to_string(), "unknown relation: employes");
    }

    #[test]
    fn protocol_error_without_message_names_status() {
        let err = DominoError::Protocol {
            status: String::new(),
            message: None,
        };
        assert_eq!(err.to_string(), "server reported status ''");
    }

    #[test]
    fn fatal_errors_are_stream_level() {
        assert!(DominoError::IncompleteFrame.is_fatal());
        assert!(DominoError::Timeout(Duration::from_millis(5)).is_fatal());
        assert!(DominoError::Transport(std::io::ErrorKind::BrokenPipe.into()).is_fatal());
        assert!(!DominoError::MalformedDocument("x".to_owned()).is_fatal());
        assert!(!DominoError::NotConnected.is_fatal());
    }
}
