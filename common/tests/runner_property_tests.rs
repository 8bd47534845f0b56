// Property-based tests for the result file: order preservation and the
// resume-offset scan

use common::models::{BatchRequestLine, BatchResultLine, ChatMessage, RequestBody};
use common::runner::output::{
    build_result_line, count_result_lines, output_path, render_prompt, ResultWriter,
};
use common::runner::GenerationOutput;
use proptest::prelude::*;

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

fn output(text: &str) -> GenerationOutput {
    GenerationOutput {
        text: text.to_string(),
        prompt_tokens: 2,
        completion_tokens: 3,
        finish_reason: "stop".to_string(),
    }
}

proptest! {
    // Result lines echo the custom_id of the request at the same index,
    // regardless of how the requests are split into chunks.
    #[test]
    fn result_lines_preserve_input_order(
        n in 1usize..40,
        chunk_size in 1usize..10,
    ) {
        let requests: Vec<BatchRequestLine> =
            (0..n).map(|i| request(&format!("req-{}", i), "x")).collect();

        let mut lines: Vec<BatchResultLine> = Vec::new();
        for chunk in requests.chunks(chunk_size) {
            for request in chunk {
                lines.push(build_result_line(request, &output("ok"), "m"));
            }
        }

        prop_assert_eq!(lines.len(), n);
        for (i, line) in lines.iter().enumerate() {
            prop_assert_eq!(line.custom_id.clone(), format!("req-{}", i));
        }
    }

    // Every result id is unique even across identical inputs.
    #[test]
    fn result_ids_are_unique(n in 2usize..30) {
        let req = request("same", "x");
        let ids: std::collections::HashSet<String> = (0..n)
            .map(|_| build_result_line(&req, &output("ok"), "m").id)
            .collect();
        prop_assert_eq!(ids.len(), n);
    }

    // Prompts are rendered role-tagged, one line per message.
    #[test]
    fn prompt_has_one_line_per_message(
        roles in proptest::collection::vec("[a-z]{2,9}", 1..6),
    ) {
        let messages: Vec<ChatMessage> = roles
            .iter()
            .map(|role| ChatMessage { role: role.clone(), content: "c".to_string() })
            .collect();
        let rendered = render_prompt(&messages);
        prop_assert_eq!(rendered.lines().count(), roles.len());
        for (line, role) in rendered.lines().zip(roles.iter()) {
            let prefix = format!("{}: ", role);
            prop_assert!(line.starts_with(&prefix));
        }
    }
}

// The resume offset equals the number of lines written so far, whatever
// point the writer stopped at.
#[tokio::test]
async fn resume_offset_tracks_written_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = output_path(dir.path(), "batch_resume");

    assert_eq!(count_result_lines(&path).await.unwrap(), 0);

    for i in 0..7 {
        // A fresh writer per iteration mirrors a worker restart mid-job
        let mut writer = ResultWriter::open(&path).await.unwrap();
        let line = build_result_line(&request(&format!("req-{}", i), "x"), &output("ok"), "m");
        writer.append(&line).await.unwrap();
        drop(writer);

        assert_eq!(count_result_lines(&path).await.unwrap(), i + 1);
    }
}

// A trailing blank line (e.g. interrupted final write of just the newline)
// does not inflate the resume offset.
#[tokio::test]
async fn blank_lines_do_not_count_toward_resume() {
    let dir = tempfile::tempdir().unwrap();
    let path = output_path(dir.path(), "batch_blank");

    let mut writer = ResultWriter::open(&path).await.unwrap();
    let line = build_result_line(&request("req-0", "x"), &output("ok"), "m");
    writer.append(&line).await.unwrap();
    drop(writer);

    tokio::fs::write(
        &path,
        format!(
            "{}\n\n",
            tokio::fs::read_to_string(&path).await.unwrap().trim_end()
        ),
    )
    .await
    .unwrap();

    assert_eq!(count_result_lines(&path).await.unwrap(), 1);
}
