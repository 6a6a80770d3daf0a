//! Smoke-test prompt

use anyhow::{Context, Result};
use std::path::Path;

use crate::data::{format_messages, ChatMessage};

/// Assistant cue that leaves the conversation open for the model
pub const ASSISTANT_CUE: &str = "<|assistant|>\n";

pub const SYSTEM_PROMPT: &str = "You are a React testing expert. You generate comprehensive Jest + React Testing Library test files for React components. Your tests are production-quality, use best practices, and achieve high code coverage.";

pub const SPINNER_REQUEST: &str = r#"Generate a comprehensive Jest + React Testing Library test file for the following React component.
The tests should achieve at least 50% code coverage.

## Component: Spinner

## Props
- size: string [optional] (default: 'md')
- className: string [optional]

## Source Code
```tsx
export function Spinner({ size = 'md', className }: { size?: string; className?: string }) {
  return <div className={`spinner spinner-${size} ${className || ''}`} role="status" aria-label="Loading" />;
}
```

## Test Requirements
- Use renderWithProviders from test-utils
- Use screen queries
- Each test should assert something meaningful"#;

/// System and user turns followed by the assistant cue
pub fn build_prompt(system: &str, request: &str) -> String {
    let mut prompt = format_messages(&[
        ChatMessage::new("system", system),
        ChatMessage::new("user", request),
    ]);
    prompt.push_str(ASSISTANT_CUE);
    prompt
}

/// Built-in Spinner prompt, or the user turn read from `prompt_file`
pub fn smoke_test_prompt(prompt_file: Option<&Path>) -> Result<String> {
    match prompt_file {
        Some(path) => {
            let request = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read prompt file {}", path.display()))?;
            Ok(build_prompt(SYSTEM_PROMPT, request.trim_end()))
        }
        None => Ok(build_prompt(SYSTEM_PROMPT, SPINNER_REQUEST)),
    }
}

/// First `max_chars` characters of `text`
pub fn preview(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
