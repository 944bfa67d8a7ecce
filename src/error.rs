use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ExportError {
    #[error("invalid export configuration: {0}")]
    #[diagnostic(code(export::configuration))]
    Configuration(String),

    #[error("catalog session could not be established (status {status}): {message}")]
    #[diagnostic(code(export::authentication))]
    Authentication { status: u16, message: String },

    #[error("unsupported output format: {0}")]
    #[diagnostic(code(export::unsupported_format))]
    UnsupportedFormat(String),

    #[error("integrity check failed: {0}")]
    #[diagnostic(code(export::integrity))]
    Integrity(String),

    #[error("catalog request failed: {0}")]
    #[diagnostic(code(export::upstream))]
    UpstreamHttp(String),

    #[error("GET {url} returned status {status}: {message}")]
    #[diagnostic(code(export::upstream))]
    UpstreamTransport {
        url: String,
        status: u16,
        message: String,
    },

    #[error("storage error: {0}")]
    #[diagnostic(code(export::storage))]
    Storage(String),
}

impl ExportError {
    pub fn kind(&self) -> &'static str {
        match self {
            ExportError::Configuration(_) => "configuration",
            ExportError::Authentication { .. } => "authentication",
            ExportError::UnsupportedFormat(_) => "unsupported_format",
            ExportError::Integrity(_) => "integrity",
            ExportError::UpstreamHttp(_) | ExportError::UpstreamTransport { .. } => "upstream",
            ExportError::Storage(_) => "storage",
        }
    }
}

