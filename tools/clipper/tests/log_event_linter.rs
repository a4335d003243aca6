use std::fs;
use std::path::{Path, PathBuf};

const LOG_CALL: &str = "append_run_log(";

#[derive(Debug)]
struct Violation {
    file: String,
    line: usize,
    event: String,
}

/// Event names are `component.action` or `component.action.outcome`, lowercase.
fn is_event_name(name: &str) -> bool {
    let parts = name.split('.').collect::<Vec<_>>();
    (2..=3).contains(&parts.len())
        && parts.iter().all(|part| {
            !part.is_empty()
                && part
                    .bytes()
                    .all(|b| b.is_ascii_lowercase() || b == b'_')
        })
}

#[test]
fn run_log_event_names_are_dotted_and_lowercase() {
    let src_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("src");
    let mut violations = Vec::new();
    let mut checked = 0usize;

    for path in rust_sources(&src_root) {
        if path.file_name().is_some_and(|name| name == "logging.rs") {
            continue;
        }
        let source = fs::read_to_string(&path).expect("read source file");
        let mut cursor = 0usize;
        while let Some(offset) = source[cursor..].find(LOG_CALL) {
            let start = cursor + offset + LOG_CALL.len();
            let Some(event_arg) = second_argument(&source[start..]) else {
                break;
            };
            let line = source[..start].bytes().filter(|b| *b == b'\n').count() + 1;
            let names = string_literals(event_arg);
            if names.is_empty() {
                violations.push(Violation {
                    file: path.display().to_string(),
                    line,
                    event: event_arg.trim().to_string(),
                });
            }
            for name in names {
                checked += 1;
                if !is_event_name(&name) {
                    violations.push(Violation {
                        file: path.display().to_string(),
                        line,
                        event: name,
                    });
                }
            }
            cursor = start;
        }
    }

    assert!(checked > 20, "expected to find run log calls, found {checked}");
    if !violations.is_empty() {
        let mut message = String::from("run log event names must look like `component.action`:\n");
        for v in violations {
            message.push_str(&format!("  - {}:{} :: {}\n", v.file, v.line, v.event));
        }
        panic!("{message}");
    }
}

#[test]
fn event_name_rule_accepts_and_rejects() {
    assert!(is_event_name("sweep.kill.sent"));
    assert!(is_event_name("pipeline.transition"));
    assert!(!is_event_name("sweep"));
    assert!(!is_event_name("Sweep.Done"));
    assert!(!is_event_name("a.b.c.d"));
}

fn rust_sources(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir).expect("read src dir") {
            let path = entry.expect("dir entry").path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|ext| ext == "rs") {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}

/// Text of the second top-level argument of a call whose opening paren has
/// already been consumed.
fn second_argument(rest: &str) -> Option<&str> {
    let bytes = rest.as_bytes();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    let mut arg_start = None;

    for (i, byte) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if *byte == b'\\' {
                escaped = true;
            } else if *byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'(' | b'{' | b'[' => depth += 1,
            b')' | b'}' | b']' if depth == 0 => return arg_start.map(|s| &rest[s..i]),
            b')' | b'}' | b']' => depth -= 1,
            b',' if depth == 0 => match arg_start {
                None => arg_start = Some(i + 1),
                Some(s) => return Some(&rest[s..i]),
            },
            _ => {}
        }
    }
    None
}

fn string_literals(text: &str) -> Vec<String> {
    text.split('"')
        .enumerate()
        .filter(|(i, _)| i % 2 == 1)
        .map(|(_, literal)| literal.to_string())
        .collect()
}
