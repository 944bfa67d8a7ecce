use std::io::{self, Write};

use serde::Serialize;
use uuid::Uuid;

use crate::bag::VerificationReport;
use crate::pipeline::{ExportOutcome, ProgressEvent, ProgressSink};

#[derive(Debug, Clone, Serialize)]
pub struct JobResult<'a> {
    pub job_id: Uuid,
    pub result: &'a ExportOutcome,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_outcome(job_id: Uuid, outcome: &ExportOutcome) -> io::Result<()> {
        Self::print_json(&JobResult {
            job_id,
            result: outcome,
        })
    }

    pub fn print_verification(report: &VerificationReport) -> io::Result<()> {
        Self::print_json(report)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}
