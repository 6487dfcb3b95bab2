/// Upload pipeline: create type and streams, send values, and in test mode verify then tear down
use std::future::Future;

use anyhow::Result;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::readings::StreamGroup;
use crate::sds::{SdsClient, SdsError, SdsStream, SdsType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Upload,
    /// Upload, verify, then remove everything that was created
    Test,
}

/// A step completed but its effect could not be observed.
#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("no value found on stream {stream_id} after insert")]
    MissingValues { stream_id: String },

    #[error("{kind} {id} still exists after delete")]
    StillPresent { kind: &'static str, id: String },

    #[error("stream {stream_id} still contains values for the uploaded indices")]
    ValuesNotRemoved { stream_id: String },
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub streams: usize,
    pub values_sent: usize,
}

pub struct Runner<'a> {
    sds: &'a SdsClient,
    type_id: String,
    create_streams: bool,
}

impl<'a> Runner<'a> {
    pub fn new(sds: &'a SdsClient, type_id: impl Into<String>, create_streams: bool) -> Self {
        Self {
            sds,
            type_id: type_id.into(),
            create_streams,
        }
    }

    /// Run the pipeline. Every error is collected; the run fails listing all of them.
    pub async fn run(&self, groups: &[StreamGroup], mode: RunMode) -> Result<RunSummary> {
        let mut errors: Vec<anyhow::Error> = Vec::new();

        let summary = match self.upload(groups).await {
            Ok(summary) => {
                if mode == RunMode::Test {
                    errors.extend(self.verify_inserted(groups).await);
                }
                summary
            }
            Err(e) => {
                error!("Upload failed: {:#}", e);
                errors.push(e);
                RunSummary::default()
            }
        };

        if mode == RunMode::Test {
            errors.extend(self.teardown(groups).await);
        }

        if errors.is_empty() {
            Ok(summary)
        } else {
            let messages: Vec<String> = errors.iter().map(|e| format!("{:#}", e)).collect();
            anyhow::bail!("Encountered {} error(s): {}", errors.len(), messages.join("; "))
        }
    }

    /// Run the pipeline until `shutdown` resolves. Requests in flight are dropped and teardown is skipped.
    pub async fn run_until(
        &self,
        groups: &[StreamGroup],
        mode: RunMode,
        shutdown: impl Future<Output = ()>,
    ) -> Result<RunSummary> {
        tokio::select! {
            biased;
            _ = shutdown => {
                warn!("Interrupted, remaining steps skipped");
                anyhow::bail!("Run interrupted")
            }
            result = self.run(groups, mode) => result,
        }
    }

    async fn upload(&self, groups: &[StreamGroup]) -> Result<RunSummary> {
        if self.create_streams {
            println!("Creating Type");
            let sds_type = self
                .sds
                .get_or_create_type(&SdsType::temperature_readings(&self.type_id))
                .await?;

            println!("Creating Streams");
            for group in groups {
                self.sds
                    .get_or_create_stream(&SdsStream::new(&group.stream_id, &sds_type.id))
                    .await?;
            }
        }

        println!("Sending Data");
        let mut summary = RunSummary::default();
        for group in groups {
            self.sds.insert_values(&group.stream_id, &group.values).await?;
            info!("Sent {} value(s) to {}", group.values.len(), group.stream_id);
            summary.streams += 1;
            summary.values_sent += group.values.len();
        }

        Ok(summary)
    }

    async fn verify_inserted(&self, groups: &[StreamGroup]) -> Vec<anyhow::Error> {
        let mut errors = Vec::new();
        for group in groups {
            match self.sds.get_last_value(&group.stream_id).await {
                Ok(Some(_)) => {}
                Ok(None) => errors.push(
                    VerificationError::MissingValues {
                        stream_id: group.stream_id.clone(),
                    }
                    .into(),
                ),
                Err(e) => errors.push(e.into()),
            }
        }
        errors
    }

    /// Attempt every cleanup step regardless of earlier failures
    async fn teardown(&self, groups: &[StreamGroup]) -> Vec<anyhow::Error> {
        if self.create_streams {
            self.delete_metadata(groups).await
        } else {
            println!("Deleting Data");
            let mut errors = Vec::new();
            for group in groups {
                if let Err(e) = self.delete_values(group).await {
                    errors.push(e);
                }
            }
            errors
        }
    }

    async fn delete_metadata(&self, groups: &[StreamGroup]) -> Vec<anyhow::Error> {
        let mut errors: Vec<anyhow::Error> = Vec::new();

        println!("Deleting Streams");
        for group in groups {
            if let Err(e) = self.sds.delete_stream(&group.stream_id).await {
                warn!("Deleting stream {} failed: {}", group.stream_id, e);
                errors.push(e.into());
            }
        }

        println!("Deleting Types");
        if let Err(e) = self.sds.delete_type(&self.type_id).await {
            warn!("Deleting type {} failed: {}", self.type_id, e);
            errors.push(e.into());
        }

        for group in groups {
            let lookup = self.sds.get_stream(&group.stream_id).await.map(|_| ());
            if let Some(e) = expect_gone(lookup, "stream", &group.stream_id) {
                errors.push(e);
            }
        }
        let lookup = self.sds.get_type(&self.type_id).await.map(|_| ());
        if let Some(e) = expect_gone(lookup, "type", &self.type_id) {
            errors.push(e);
        }

        errors
    }

    async fn delete_values(&self, group: &StreamGroup) -> Result<()> {
        let indices = group.indices();

        let current = self.sds.get_values(&group.stream_id, &indices).await?;
        if current.is_empty() {
            return Ok(());
        }

        self.sds.remove_values(&group.stream_id, &indices).await?;

        let remaining = self.sds.get_values(&group.stream_id, &indices).await?;
        if !remaining.is_empty() {
            return Err(VerificationError::ValuesNotRemoved {
                stream_id: group.stream_id.clone(),
            }
            .into());
        }

        Ok(())
    }
}

/// A lookup after delete must come back NotFound
fn expect_gone(lookup: Result<(), SdsError>, kind: &'static str, id: &str) -> Option<anyhow::Error> {
    match lookup {
        Err(e) if e.is_not_found() => None,
        Ok(()) => Some(
            VerificationError::StillPresent {
                kind,
                id: id.to_string(),
            }
            .into(),
        ),
        Err(e) => Some(anyhow::Error::new(e).context(format!("Could not confirm {} {} was deleted", kind, id))),
    }
}
