// Result-file handling: append-only JSONL with per-line fsync, plus the
// line-count scan that drives crash resume.

use crate::errors::RunnerError;
use crate::models::{
    self, BatchRequestLine, BatchResultLine, ChatCompletionBody, ChatMessage, CompletionChoice,
    ResultResponse, TokenUsage,
};
use crate::runner::model::GenerationOutput;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// Where a job's results live on disk
pub fn output_path(output_dir: &Path, batch_id: &str) -> PathBuf {
    output_dir.join(format!("{}_results.jsonl", batch_id))
}

/// Serialize chat messages into the canonical role-tagged prompt
pub fn render_prompt(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Build one OpenAI-shaped result line for a request/output pair
pub fn build_result_line(
    request: &BatchRequestLine,
    output: &GenerationOutput,
    model: &str,
) -> BatchResultLine {
    BatchResultLine {
        id: models::new_result_id(),
        custom_id: request.custom_id.clone(),
        response: ResultResponse {
            status_code: 200,
            request_id: models::new_request_id(),
            body: ChatCompletionBody {
                id: models::new_completion_id(),
                object: "chat.completion".to_string(),
                created: models::unix_now(),
                model: model.to_string(),
                choices: vec![CompletionChoice {
                    index: 0,
                    message: ChatMessage {
                        role: "assistant".to_string(),
                        content: output.text.clone(),
                    },
                    finish_reason: output.finish_reason.clone(),
                }],
                usage: TokenUsage {
                    prompt_tokens: output.prompt_tokens,
                    completion_tokens: output.completion_tokens,
                    total_tokens: output.total_tokens(),
                },
            },
        },
        error: None,
    }
}

/// Count non-blank lines already persisted; this is the resume offset.
/// A missing file means a fresh start.
pub async fn count_result_lines(path: &Path) -> Result<usize, RunnerError> {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut lines = BufReader::new(file).lines();
    let mut count = 0;
    while let Some(line) = lines.next_line().await? {
        if !line.trim().is_empty() {
            count += 1;
        }
    }
    Ok(count)
}

/// Append-only writer for a job's result file.
///
/// Each line is fsync'd before the in-memory progress advances, so the
/// on-disk line count never overstates what survived a crash.
pub struct ResultWriter {
    file: tokio::fs::File,
}

impl ResultWriter {
    pub async fn open(path: &Path) -> Result<Self, RunnerError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self { file })
    }

    /// Append one result line and flush it to disk
    pub async fn append(&mut self, line: &BatchResultLine) -> Result<(), RunnerError> {
        let mut encoded = serde_json::to_string(line)
            .map_err(|e| RunnerError::Inference(format!("result serialization failed: {}", e)))?;
        encoded.push('\n');

        self.file.write_all(encoded.as_bytes()).await?;
        self.file.sync_data().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RequestBody;

    fn request(custom_id: &str) -> BatchRequestLine {
        BatchRequestLine {
            custom_id: custom_id.to_string(),
            method: "POST".to_string(),
            url: "/v1/chat/completions".to_string(),
            body: RequestBody {
                messages: vec![
                    ChatMessage {
                        role: "system".to_string(),
                        content: "You are terse.".to_string(),
                    },
                    ChatMessage {
                        role: "user".to_string(),
                        content: "hello".to_string(),
                    },
                ],
                extra: serde_json::Map::new(),
            },
        }
    }

    fn output(text: &str) -> GenerationOutput {
        GenerationOutput {
            text: text.to_string(),
            prompt_tokens: 7,
            completion_tokens: 5,
            finish_reason: "stop".to_string(),
        }
    }

    #[test]
    fn test_render_prompt_role_tagged() {
        let rendered = render_prompt(&request("r1").body.messages);
        assert_eq!(rendered, "system: You are terse.\nuser: hello");
    }

    #[test]
    fn test_result_line_echoes_custom_id_and_usage() {
        let line = build_result_line(&request("r1"), &output("hi"), "llama-3");
        assert_eq!(line.custom_id, "r1");
        assert!(line.id.starts_with("batch_req_"));
        assert!(line.error.is_none());
        assert_eq!(line.response.status_code, 200);

        let body = &line.response.body;
        assert_eq!(body.object, "chat.completion");
        assert_eq!(body.model, "llama-3");
        assert_eq!(body.choices[0].message.role, "assistant");
        assert_eq!(body.choices[0].message.content, "hi");
        assert_eq!(body.choices[0].finish_reason, "stop");
        assert_eq!(body.usage.total_tokens, 12);
    }

    #[tokio::test]
    async fn test_count_missing_file_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = output_path(dir.path(), "batch_none");
        assert_eq!(count_result_lines(&path).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_writer_appends_and_count_matches() {
        let dir = tempfile::tempdir().unwrap();
        let path = output_path(dir.path(), "batch_abc");

        let mut writer = ResultWriter::open(&path).await.unwrap();
        for id in ["r1", "r2", "r3"] {
            let line = build_result_line(&request(id), &output("ok"), "llama-3");
            writer.append(&line).await.unwrap();
        }
        drop(writer);

        assert_eq!(count_result_lines(&path).await.unwrap(), 3);

        // Reopening appends after the existing lines, as resume does
        let mut writer = ResultWriter::open(&path).await.unwrap();
        let line = build_result_line(&request("r4"), &output("ok"), "llama-3");
        writer.append(&line).await.unwrap();
        drop(writer);

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let ids: Vec<String> = content
            .lines()
            .map(|l| {
                serde_json::from_str::<BatchResultLine>(l)
                    .unwrap()
                    .custom_id
            })
            .collect();
        assert_eq!(ids, vec!["r1", "r2", "r3", "r4"]);
    }
}
