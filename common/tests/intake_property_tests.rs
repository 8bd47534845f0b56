// Property-based tests for intake JSONL validation

use common::errors::AdmissionError;
use common::intake::{parse_completion_window, validate_jsonl};
use proptest::prelude::*;

fn request_line(custom_id: &str, content: &str) -> String {
    serde_json::json!({
        "custom_id": custom_id,
        "method": "POST",
        "url": "/v1/chat/completions",
        "body": { "messages": [ { "role": "user", "content": content } ] }
    })
    .to_string()
}

proptest! {
    // Any well-formed file validates, and the parsed requests come back in
    // file order with their custom_ids intact.
    #[test]
    fn valid_files_preserve_count_and_order(
        contents in proptest::collection::vec("[ -~]{0,40}", 1..50)
    ) {
        let jsonl: String = contents
            .iter()
            .enumerate()
            .map(|(i, content)| request_line(&format!("req-{}", i), content))
            .collect::<Vec<_>>()
            .join("\n");

        let requests = validate_jsonl(&jsonl, 50_000).unwrap();
        prop_assert_eq!(requests.len(), contents.len());
        for (i, request) in requests.iter().enumerate() {
            prop_assert_eq!(request.custom_id.clone(), format!("req-{}", i));
        }
    }

    // Duplicating any line's custom_id gets the file rejected, citing the
    // line where the duplicate appears.
    #[test]
    fn duplicate_custom_id_is_always_rejected(
        n in 2usize..30,
        dup_source in 0usize..29,
    ) {
        let dup_source = dup_source % (n - 1);
        let mut lines: Vec<String> = (0..n)
            .map(|i| request_line(&format!("req-{}", i), "hello"))
            .collect();
        lines.push(request_line(&format!("req-{}", dup_source), "again"));
        let jsonl = lines.join("\n");

        match validate_jsonl(&jsonl, 50_000) {
            Err(AdmissionError::DuplicateCustomId { custom_id, line }) => {
                prop_assert_eq!(custom_id, format!("req-{}", dup_source));
                prop_assert_eq!(line, n + 1);
            }
            other => prop_assert!(false, "expected duplicate rejection, got {:?}", other.is_ok()),
        }
    }

    // A malformed line anywhere in the file is rejected with its 1-based
    // line number.
    #[test]
    fn malformed_line_is_cited_by_number(
        before in 0usize..20,
        after in 0usize..20,
    ) {
        let mut lines: Vec<String> = (0..before)
            .map(|i| request_line(&format!("before-{}", i), "x"))
            .collect();
        lines.push("{not valid json".to_string());
        lines.extend((0..after).map(|i| request_line(&format!("after-{}", i), "x")));
        let jsonl = lines.join("\n");

        match validate_jsonl(&jsonl, 50_000) {
            Err(AdmissionError::InvalidLine { line, .. }) => {
                prop_assert_eq!(line, before + 1);
            }
            other => prop_assert!(false, "expected invalid-line rejection, got {:?}", other.is_ok()),
        }
    }

    // The size gate is exact: max requests pass, max + 1 is rejected.
    #[test]
    fn request_count_limit_is_exact(max in 1usize..40) {
        let at_limit: String = (0..max)
            .map(|i| request_line(&format!("req-{}", i), "x"))
            .collect::<Vec<_>>()
            .join("\n");
        prop_assert!(validate_jsonl(&at_limit, max).is_ok());

        let over: String = (0..max + 1)
            .map(|i| request_line(&format!("req-{}", i), "x"))
            .collect::<Vec<_>>()
            .join("\n");
        prop_assert!(
            matches!(
                validate_jsonl(&over, max),
                Err(AdmissionError::TooManyRequests { .. })
            ),
            "expected TooManyRequests error"
        );
    }

    // Completion windows round-trip through hours.
    #[test]
    fn completion_window_hours_round_trip(hours in 1i64..10_000) {
        let window = format!("{}h", hours);
        prop_assert_eq!(parse_completion_window(&window).unwrap(), hours * 3600);
    }
}
