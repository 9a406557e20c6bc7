use std::io::{self, Write};

use serde::Serialize;

use crate::app::{BatchReport, DatasetAction, ProgressEvent, ProgressSink};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

#[derive(Debug, Serialize)]
struct BatchSummary<'a> {
    succeeded: usize,
    failed: usize,
    datasets: Vec<DatasetSummary<'a>>,
}

#[derive(Debug, Serialize)]
struct DatasetSummary<'a> {
    dataset: &'a str,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    action: Option<DatasetAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fetched: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    passes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<'a> From<&'a BatchReport> for BatchSummary<'a> {
    fn from(report: &'a BatchReport) -> Self {
        let datasets = report
            .entries
            .iter()
            .map(|entry| match &entry.result {
                Ok(result) => DatasetSummary {
                    dataset: &entry.dataset,
                    status: "ok",
                    action: Some(result.action),
                    path: Some(&result.path),
                    fetched: result.outcome.as_ref().map(|outcome| outcome.fetched),
                    passes: result.outcome.as_ref().map(|outcome| outcome.passes),
                    error: None,
                },
                Err(err) => DatasetSummary {
                    dataset: &entry.dataset,
                    status: "failed",
                    action: None,
                    path: None,
                    fetched: None,
                    passes: None,
                    error: Some(err.to_string()),
                },
            })
            .collect();
        Self {
            succeeded: report.succeeded(),
            failed: report.failed(),
            datasets,
        }
    }
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_batch(report: &BatchReport) -> io::Result<()> {
        Self::print_json(&BatchSummary::from(report))
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

/// Prints progress lines to stderr for interactive runs.
pub struct ConsoleProgress;

impl ProgressSink for ConsoleProgress {
    fn event(&self, event: ProgressEvent) {
        let mut stderr = io::stderr().lock();
        let _ = match event.elapsed {
            Some(elapsed) => writeln!(stderr, "» {} ({:.1}s)", event.message, elapsed.as_secs_f64()),
            None => writeln!(stderr, "» {}", event.message),
        };
    }
}
