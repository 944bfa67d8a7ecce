//! Output-format dispatch: what to ask the catalog for and what to do with the answer.

use crate::domain::OutputFormat;

pub const ACCEPT_CSV: &str = "text/csv";
pub const ACCEPT_JSON: &str = "application/json";
pub const ACCEPT_JSON_STREAM: &str = "application/x-json-stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostProcess {
    None,
    Fasta,
    Prefetch,
    Defer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatPlan {
    pub accept: &'static str,
    /// Extension of the file written into the payload. `None` for manifest-only formats.
    pub extension: Option<&'static str>,
    pub post: PostProcess,
}

impl FormatPlan {
    pub fn is_manifest(&self) -> bool {
        self.extension.is_none()
    }
}

pub fn plan(format: OutputFormat) -> FormatPlan {
    match format {
        OutputFormat::Csv => FormatPlan {
            accept: ACCEPT_CSV,
            extension: Some(".csv"),
            post: PostProcess::None,
        },
        OutputFormat::Json => FormatPlan {
            accept: ACCEPT_JSON,
            extension: Some(".json"),
            post: PostProcess::None,
        },
        OutputFormat::Fasta => FormatPlan {
            accept: ACCEPT_JSON_STREAM,
            extension: Some(".json"),
            post: PostProcess::Fasta,
        },
        OutputFormat::Prefetch => FormatPlan {
            accept: ACCEPT_JSON_STREAM,
            extension: None,
            post: PostProcess::Prefetch,
        },
        OutputFormat::Fetch => FormatPlan {
            accept: ACCEPT_JSON_STREAM,
            extension: None,
            post: PostProcess::Defer,
        },
    }
}
