/// CSV temperature readings and per-stream grouping
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One CSV row: `StreamId,Timestamp,Temperature`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TemperatureReadingRow {
    #[serde(rename = "StreamId")]
    pub stream_id: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "Temperature")]
    pub temperature: f64,
}

/// Value stored on a stream (the stream id is implied by where it is sent)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TemperatureReading {
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
}

impl From<&TemperatureReadingRow> for TemperatureReading {
    fn from(row: &TemperatureReadingRow) -> Self {
        Self {
            timestamp: row.timestamp,
            temperature: row.temperature,
        }
    }
}

/// All values destined for one stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamGroup {
    pub stream_id: String,
    pub values: Vec<TemperatureReading>,
}

impl StreamGroup {
    /// Index strings used to address this group's values on the service
    pub fn indices(&self) -> Vec<String> {
        self.values
            .iter()
            .map(|v| v.timestamp.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true))
            .collect()
    }
}

pub fn read_csv(path: impl AsRef<Path>) -> Result<Vec<TemperatureReadingRow>> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open CSV file: {}", path.display()))?;
    from_reader(file).with_context(|| format!("Failed to read CSV file: {}", path.display()))
}

pub fn from_reader<R: Read>(reader: R) -> Result<Vec<TemperatureReadingRow>> {
    let mut csv_reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    csv_reader.deserialize::<TemperatureReadingRow>()
        .enumerate()
        .map(|(i, row)| row.with_context(|| format!("Invalid CSV record {}", i + 1)))
        .collect()
}

/// Group rows by stream id, keeping streams in first-seen order
pub fn group_by_stream(rows: &[TemperatureReadingRow]) -> Vec<StreamGroup> {
    let mut groups: Vec<StreamGroup> = Vec::new();

    for row in rows {
        match groups.iter_mut().find(|g| g.stream_id == row.stream_id) {
            Some(group) => group.values.push(row.into()),
            None => groups.push(StreamGroup {
                stream_id: row.stream_id.clone(),
                values: vec![row.into()],
            }),
        }
    }

    groups
}
