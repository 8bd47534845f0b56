// Runner: executes one batch job at a time with chunked inference,
// incremental fsync'd output, and crash resume from the output file.

pub mod model;
pub mod output;

pub use model::{GenerationOutput, ModelRunner, SamplingOptions};

use crate::config::{RunnerConfig, StorageConfig};
use crate::db::repositories::{BatchJobRepository, FileRepository, HeartbeatRepository};
use crate::db::DbPool;
use crate::errors::RunnerError;
use crate::gpu::{self, HealthProbe};
use crate::models::{
    self, BatchJob, BatchRequestLine, BatchStatus, FilePurpose, StoredFile, WorkerStatus,
};
use crate::telemetry;
use crate::webhook::WebhookDispatcher;
use chrono::Utc;
use output::{build_result_line, count_result_lines, output_path, render_prompt, ResultWriter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument};

/// How a job run ended when nothing went wrong
enum JobOutcome {
    Completed,
    Cancelled,
    /// The job stopped being runnable between selection and pickup
    Skipped,
}

/// Render a chunk's prompts and run them through the model runner
async fn generate_chunk(
    model_runner: &dyn ModelRunner,
    chunk: &[BatchRequestLine],
    sampling: &SamplingOptions,
) -> Result<Vec<GenerationOutput>, RunnerError> {
    let prompts: Vec<String> = chunk
        .iter()
        .map(|request| render_prompt(&request.body.messages))
        .collect();

    let outputs = model_runner.generate(&prompts, sampling).await?;
    if outputs.len() != chunk.len() {
        return Err(RunnerError::Inference(format!(
            "model runner returned {} outputs for {} prompts",
            outputs.len(),
            chunk.len()
        )));
    }
    Ok(outputs)
}

/// Processes exactly one job at a time on the single GPU worker
pub struct BatchRunner {
    jobs: BatchJobRepository,
    files: FileRepository,
    heartbeat: HeartbeatRepository,
    model_runner: Arc<dyn ModelRunner>,
    probe: Arc<dyn HealthProbe>,
    dispatcher: WebhookDispatcher,
    chunk_size: usize,
    sampling: SamplingOptions,
    output_dir: PathBuf,
}

impl BatchRunner {
    pub fn new(
        pool: DbPool,
        model_runner: Arc<dyn ModelRunner>,
        probe: Arc<dyn HealthProbe>,
        dispatcher: WebhookDispatcher,
        runner_config: &RunnerConfig,
        storage: &StorageConfig,
    ) -> Self {
        Self {
            jobs: BatchJobRepository::new(pool.clone()),
            files: FileRepository::new(pool.clone()),
            heartbeat: HeartbeatRepository::new(pool),
            model_runner,
            probe,
            dispatcher,
            chunk_size: runner_config.chunk_size,
            sampling: SamplingOptions::from(runner_config),
            output_dir: storage.output_dir(),
        }
    }

    /// Run a job to a terminal state. Inference and filesystem errors are
    /// translated into a `failed` transition and never propagated; store
    /// integrity errors do propagate so the worker crashes and the watchdog
    /// restarts it (the job then resumes from its output file).
    #[instrument(skip(self, job), fields(batch_id = %job.batch_id, model = %job.model))]
    pub async fn run(&self, job: BatchJob) -> Result<(), RunnerError> {
        let batch_id = job.batch_id.clone();
        let model = job.model.clone();
        let has_webhook = job.webhook_url.is_some();

        match self.execute(job).await {
            Ok(JobOutcome::Completed) => {
                telemetry::record_job_completed(&batch_id, &model);
                if has_webhook {
                    self.dispatcher.spawn(batch_id);
                }
                Ok(())
            }
            Ok(JobOutcome::Cancelled) => {
                telemetry::record_job_cancelled(&batch_id);
                Ok(())
            }
            Ok(JobOutcome::Skipped) => Ok(()),
            Err(RunnerError::Store(e)) => Err(RunnerError::Store(e)),
            Err(e) => {
                // A cancellation may have arrived while the failing chunk was
                // in flight; it wins over the failure transition
                if self.jobs.status_of(&batch_id).await? == BatchStatus::Cancelling {
                    self.jobs.mark_cancelled(&batch_id).await?;
                    telemetry::record_job_cancelled(&batch_id);
                    return Ok(());
                }

                let message = e.to_string();
                error!(batch_id = %batch_id, error = %message, "Batch job failed");
                self.jobs.mark_failed(&batch_id, &message).await?;
                telemetry::record_job_failed(&batch_id, &model, &message);
                if has_webhook {
                    self.dispatcher.spawn(batch_id);
                }
                Ok(())
            }
        }
    }

    async fn execute(&self, job: BatchJob) -> Result<JobOutcome, RunnerError> {
        let batch_id = job.batch_id.clone();

        match job.status {
            BatchStatus::Validating => {
                match self.jobs.mark_in_progress(&batch_id).await {
                    Ok(()) => {}
                    // A cancellation can win the race between selection and
                    // pickup; the job is simply no longer ours to run
                    Err(crate::errors::StoreError::InvalidTransition { .. }) => {
                        info!(batch_id = %batch_id, "Job left the pending state before pickup");
                        return Ok(JobOutcome::Skipped);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            BatchStatus::InProgress => {
                info!(batch_id = %batch_id, "Recovering interrupted job");
            }
            other => {
                return Err(RunnerError::Store(crate::errors::StoreError::InvalidTransition {
                    batch_id,
                    detail: format!("runner handed a job in status '{}'", other),
                }))
            }
        }

        let snapshot = self.probe.read().await;
        self.heartbeat
            .beat(WorkerStatus::Processing, Some(&batch_id), snapshot.as_ref())
            .await?;

        self.ensure_model(&job.model).await?;

        let requests = self.load_requests(&job).await?;
        let total = requests.len();

        let out_path = output_path(&self.output_dir, &batch_id);
        let resume = count_result_lines(&out_path).await?.min(total);
        if resume > 0 {
            info!(
                batch_id = %batch_id,
                resume_offset = resume,
                total = total,
                "Resuming from persisted results"
            );
            self.jobs
                .set_completed_requests(&batch_id, resume as i32)
                .await?;
        }

        let mut writer = ResultWriter::open(&out_path).await?;
        let mut total_inference = Duration::ZERO;
        let mut run_tokens: i64 = 0;
        let mut index = resume;

        while index < total {
            // Cancellation is observed only at chunk boundaries
            if self.jobs.status_of(&batch_id).await? == BatchStatus::Cancelling {
                self.jobs.mark_cancelled(&batch_id).await?;
                info!(batch_id = %batch_id, results_on_disk = index, "Job cancelled");
                return Ok(JobOutcome::Cancelled);
            }

            let snapshot = self.probe.read().await;
            let chunk_size = gpu::safe_chunk_size(self.chunk_size, snapshot.as_ref());
            let end = (index + chunk_size).min(total);
            let chunk = &requests[index..end];

            info!(
                batch_id = %batch_id,
                chunk_start = index,
                chunk_end = end,
                chunk_size = chunk.len(),
                "Running chunk inference"
            );

            let started = Instant::now();
            let outputs = generate_chunk(self.model_runner.as_ref(), chunk, &self.sampling).await?;
            let chunk_elapsed = started.elapsed();
            total_inference += chunk_elapsed;

            let mut chunk_tokens: i64 = 0;
            for (request, generation) in chunk.iter().zip(outputs.iter()) {
                let line = build_result_line(request, generation, &job.model);
                writer.append(&line).await?;
                chunk_tokens += i64::from(generation.total_tokens());
            }
            run_tokens += chunk_tokens;

            let throughput = if total_inference.as_secs_f64() > 0.0 {
                run_tokens as f64 / total_inference.as_secs_f64()
            } else {
                0.0
            };
            let estimated_completion = estimate_completion(total_inference, end - resume, total - end);

            self.jobs
                .record_chunk_progress(
                    &batch_id,
                    (end - index) as i32,
                    chunk_tokens,
                    throughput,
                    estimated_completion,
                    snapshot.as_ref(),
                )
                .await?;
            telemetry::record_chunk(&batch_id, chunk.len(), chunk_elapsed.as_secs_f64());

            index = end;
        }

        // A cancellation that arrived during the final chunk is honored
        // here; the chunk itself ran to completion by design
        if self.jobs.status_of(&batch_id).await? == BatchStatus::Cancelling {
            self.jobs.mark_cancelled(&batch_id).await?;
            info!(batch_id = %batch_id, results_on_disk = index, "Job cancelled");
            return Ok(JobOutcome::Cancelled);
        }

        self.finalize(&job, &out_path, run_tokens, total_inference)
            .await?;
        Ok(JobOutcome::Completed)
    }

    /// Load the requested model, unloading the previous one first.
    /// A failure here fails the job before any output is written.
    async fn ensure_model(&self, model: &str) -> Result<(), RunnerError> {
        let loaded = self
            .heartbeat
            .get()
            .await?
            .and_then(|hb| hb.loaded_model);

        if loaded.as_deref() == Some(model) {
            info!(model = %model, "Model already loaded, reusing");
            return Ok(());
        }

        if let Some(previous) = loaded {
            info!(previous = %previous, next = %model, "Unloading previous model");
            self.model_runner.unload().await?;
            self.heartbeat.set_loaded_model(None).await?;
        }

        let started = Instant::now();
        self.model_runner.load(model).await.map_err(|e| match e {
            err @ RunnerError::ModelLoad { .. } => err,
            other => RunnerError::ModelLoad {
                model: model.to_string(),
                reason: other.to_string(),
            },
        })?;
        self.heartbeat.set_loaded_model(Some(model)).await?;

        info!(
            model = %model,
            load_seconds = started.elapsed().as_secs_f64(),
            "Model loaded"
        );
        Ok(())
    }

    async fn load_requests(&self, job: &BatchJob) -> Result<Vec<BatchRequestLine>, RunnerError> {
        let input_file = self
            .files
            .get(&job.input_file_id)
            .await?
            .ok_or_else(|| RunnerError::InputFileNotFound(job.input_file_id.clone()))?;

        let content = tokio::fs::read_to_string(&input_file.path).await?;

        let mut requests = Vec::new();
        for (idx, raw) in content.lines().enumerate() {
            if raw.trim().is_empty() {
                continue;
            }
            let request: BatchRequestLine =
                serde_json::from_str(raw).map_err(|e| RunnerError::MalformedRequest {
                    line: idx + 1,
                    reason: e.to_string(),
                })?;
            requests.push(request);
        }
        Ok(requests)
    }

    async fn finalize(
        &self,
        job: &BatchJob,
        out_path: &std::path::Path,
        run_tokens: i64,
        total_inference: Duration,
    ) -> Result<(), RunnerError> {
        let bytes = tokio::fs::metadata(out_path).await?.len() as i64;

        let output_file = StoredFile {
            file_id: models::new_output_file_id(),
            filename: format!("{}_results.jsonl", job.batch_id),
            bytes,
            purpose: FilePurpose::BatchOutput,
            created_at: models::unix_now(),
            path: out_path.to_string_lossy().into_owned(),
            deleted: false,
        };

        let throughput = if total_inference.as_secs_f64() > 0.0 {
            run_tokens as f64 / total_inference.as_secs_f64()
        } else {
            0.0
        };

        self.jobs.mark_finalizing(&job.batch_id).await?;
        self.jobs
            .mark_completed(&job.batch_id, &output_file, run_tokens, throughput)
            .await?;

        info!(
            batch_id = %job.batch_id,
            total_tokens = run_tokens,
            throughput_tokens_per_sec = throughput,
            inference_seconds = total_inference.as_secs_f64(),
            "Batch job finalized"
        );
        Ok(())
    }
}

/// Remaining-time estimate from this run's inference pace; model load and
/// resumed work are excluded
fn estimate_completion(
    elapsed_inference: Duration,
    processed: usize,
    remaining: usize,
) -> Option<chrono::DateTime<Utc>> {
    if processed == 0 || remaining == 0 {
        return None;
    }
    let per_request = elapsed_inference.as_secs_f64() / processed as f64;
    let remaining_secs = per_request * remaining as f64;
    let remaining = chrono::Duration::try_milliseconds((remaining_secs * 1000.0) as i64)?;
    Some(Utc::now() + remaining)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChatMessage, RequestBody};
    use crate::runner::model::MockModelRunner;

    fn request(custom_id: &str, content: &str) -> BatchRequestLine {
        BatchRequestLine {
            custom_id: custom_id.to_string(),
            method: "POST".to_string(),
            url: "/v1/chat/completions".to_string(),
            body: RequestBody {
                messages: vec![ChatMessage {
                    role: "user".to_string(),
                    content: content.to_string(),
                }],
                extra: serde_json::Map::new(),
            },
        }
    }

    fn sampling() -> SamplingOptions {
        SamplingOptions {
            temperature: 0.7,
            top_p: 0.9,
            max_tokens: 64,
        }
    }

    #[tokio::test]
    async fn test_generate_chunk_maps_outputs_in_order() {
        let mut runner = MockModelRunner::new();
        runner.expect_generate().returning(|prompts, _| {
            Ok(prompts
                .iter()
                .map(|p| GenerationOutput {
                    text: format!("echo:{}", p),
                    prompt_tokens: 3,
                    completion_tokens: 4,
                    finish_reason: "stop".to_string(),
                })
                .collect())
        });

        let chunk = vec![request("r1", "one"), request("r2", "two")];
        let outputs = generate_chunk(&runner, &chunk, &sampling()).await.unwrap();

        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].text, "echo:user: one");
        assert_eq!(outputs[1].text, "echo:user: two");
    }

    #[tokio::test]
    async fn test_generate_chunk_rejects_output_count_mismatch() {
        let mut runner = MockModelRunner::new();
        runner.expect_generate().returning(|_, _| Ok(Vec::new()));

        let chunk = vec![request("r1", "one")];
        let err = generate_chunk(&runner, &chunk, &sampling())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Inference(_)));
    }

    #[tokio::test]
    async fn test_generate_chunk_propagates_inference_error() {
        let mut runner = MockModelRunner::new();
        runner
            .expect_generate()
            .returning(|_, _| Err(RunnerError::Inference("CUDA out of memory".to_string())));

        let chunk = vec![request("r1", "one")];
        let err = generate_chunk(&runner, &chunk, &sampling())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("CUDA out of memory"));
    }

    #[test]
    fn test_estimate_completion_scales_with_remaining() {
        let estimate = estimate_completion(Duration::from_secs(10), 5, 10).unwrap();
        let remaining = (estimate - Utc::now()).num_seconds();
        // 2s per request, 10 remaining -> about 20s out
        assert!((18..=21).contains(&remaining), "estimate was {}s", remaining);

        assert!(estimate_completion(Duration::from_secs(10), 0, 10).is_none());
        assert!(estimate_completion(Duration::from_secs(10), 5, 0).is_none());
    }
}
