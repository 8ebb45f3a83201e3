//! O tipo de job embutido `sleep`, que faz as vezes de trabalho real.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::sleep;

use super::model::Job;
use super::registry::JobHandler;

pub const SLEEP_JOB_TYPE: &str = "sleep";

/// Dorme tantos segundos quanto diz o dataset.
pub struct SleepJob;

fn seconds(dataset: &Value) -> u64 {
    dataset.as_u64().unwrap_or(0)
}

#[async_trait]
impl JobHandler for SleepJob {
    fn time_estimate(&self, dataset: &Value) -> u64 {
        seconds(dataset)
    }

    async fn run(&self, job: &mut Job) -> anyhow::Result<()> {
        let secs = match job.dataset() {
            Value::Number(_) => seconds(job.dataset()),
            other => anyhow::bail!("sleep expects a number of seconds, got {other}"),
        };
        sleep(Duration::from_secs(secs)).await;
        job.log_output(format!("Slept for {secs}s"));
        Ok(())
    }
}
