//! Training data loading and flattening

use std::io::Write;
use tempfile::tempdir;
use testgen_core::data::{
    format_messages, load_training_data, write_formatted, ChatMessage, DataError, DatasetStats,
};

fn write_lines(path: &std::path::Path, lines: &[&str]) {
    let mut file = std::fs::File::create(path).expect("test: create");
    for line in lines {
        writeln!(file, "{}", line).expect("test: write");
    }
}

#[test]
fn test_load_flattens_each_record() {
    let dir = tempdir().expect("test: tempdir");
    let path = dir.path().join("training.jsonl");
    write_lines(
        &path,
        &[
            r#"{"messages":[{"role":"system","content":"S"},{"role":"user","content":"U"},{"role":"assistant","content":"A"}]}"#,
            "",
            r#"{"messages":[{"role":"user","content":"only user"}]}"#,
        ],
    );

    let examples = load_training_data(&path).expect("test: load");
    assert_eq!(examples.len(), 2);
    assert_eq!(
        examples[0].text,
        "<|system|>\nS\n<|user|>\nU\n<|assistant|>\nA\n<|end|>"
    );
    assert_eq!(examples[1].text, "<|user|>\nonly user\n<|end|>");
}

#[test]
fn test_multiline_content_is_kept_verbatim() {
    let messages = vec![
        ChatMessage::new("user", "line one\nline two"),
        ChatMessage::new("assistant", "it('renders', () => {});"),
    ];
    assert_eq!(
        format_messages(&messages),
        "<|user|>\nline one\nline two\n<|assistant|>\nit('renders', () => {});\n"
    );
}

#[test]
fn test_unknown_role_is_skipped() {
    let messages = vec![
        ChatMessage::new("tool", "ignored"),
        ChatMessage::new("assistant", "A"),
    ];
    assert_eq!(format_messages(&messages), "<|assistant|>\nA\n");
}

#[test]
fn test_malformed_line_reports_line_number() {
    let dir = tempdir().expect("test: tempdir");
    let path = dir.path().join("training.jsonl");
    write_lines(
        &path,
        &[
            r#"{"messages":[{"role":"user","content":"ok"}]}"#,
            r#"{"messages": [ not json"#,
        ],
    );

    let err = load_training_data(&path).expect_err("test: should fail");
    match err {
        DataError::MalformedLineInFile { line, .. } => assert_eq!(line, 2),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_empty_and_missing_files() {
    let dir = tempdir().expect("test: tempdir");
    let empty = dir.path().join("empty.jsonl");
    write_lines(&empty, &["", "   "]);
    assert!(matches!(
        load_training_data(&empty),
        Err(DataError::EmptyDataset(_))
    ));

    let missing = dir.path().join("missing.jsonl");
    assert!(matches!(
        load_training_data(&missing),
        Err(DataError::Io { .. })
    ));
}

#[test]
fn test_write_formatted_and_stats() {
    let dir = tempdir().expect("test: tempdir");
    let input = dir.path().join("training.jsonl");
    write_lines(
        &input,
        &[
            r#"{"messages":[{"role":"user","content":"ab"}]}"#,
            r#"{"messages":[{"role":"user","content":"abcdef"}]}"#,
        ],
    );
    let examples = load_training_data(&input).expect("test: load");

    let out = dir.path().join("formatted.jsonl");
    write_formatted(&out, &examples).expect("test: write");
    let lines: Vec<serde_json::Value> = std::fs::read_to_string(&out)
        .expect("test: read")
        .lines()
        .map(|l| serde_json::from_str(l).expect("test: parse"))
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["text"], examples[0].text.as_str());

    let stats = DatasetStats::from_examples(&examples);
    assert_eq!(stats.examples, 2);
    let expected = (examples[0].text.len() + examples[1].text.len()) as f64 / 2.0;
    assert!((stats.average_length - expected).abs() < 1e-9);
    assert!(stats.preview.starts_with("<|user|>"));
}
