use std::fs;
use std::path::{Path, PathBuf};

/// Files allowed to decrypt broker credentials
const ALLOWED_DECRYPT_CALLERS: &[&str] = &["src/agents/auth_refresh.rs", "src/vault/mod.rs"];

/// Files allowed to write session tokens into the runtime store
const ALLOWED_TOKEN_WRITERS: &[&str] = &[
    "src/agents/auth_refresh.rs",
    "src/runtime/mod.rs",
    "src/runtime/memory.rs",
    "src/runtime/postgres.rs",
];

fn collect_rust_files(root: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_rust_files(&path, out);
            continue;
        }
        if path.extension().and_then(|s| s.to_str()) == Some("rs") {
            out.push(path);
        }
    }
}

/// `(relative path, line number, line)` for every non-test source line
fn production_lines() -> Vec<(String, usize, String)> {
    let repo_root = Path::new(env!("CARGO_MANIFEST_DIR"));
    let mut files = Vec::new();
    collect_rust_files(&repo_root.join("src"), &mut files);

    let mut lines = Vec::new();
    for file in files {
        let rel = file
            .strip_prefix(repo_root)
            .unwrap_or(&file)
            .to_string_lossy()
            .replace('\\', "/");
        let content = fs::read_to_string(&file).unwrap_or_default();
        for (idx, line) in content.lines().enumerate() {
            if line.trim() == "#[cfg(test)]" {
                break;
            }
            lines.push((rel.clone(), idx + 1, line.trim().to_string()));
        }
    }
    lines
}

fn offenders(needle: &str, allowed: &[&str]) -> Vec<String> {
    production_lines()
        .into_iter()
        .filter(|(rel, _, line)| line.contains(needle) && !allowed.contains(&rel.as_str()))
        .map(|(rel, n, line)| format!("{rel}:{n}: {line}"))
        .collect()
}

#[test]
fn credential_decryption_is_limited_to_auth_agent() {
    let found = offenders(".decrypt(", ALLOWED_DECRYPT_CALLERS);
    assert!(
        found.is_empty(),
        "credential decryption outside the auth agent:\n{}",
        found.join("\n")
    );
}

#[test]
fn session_tokens_are_written_only_by_auth_agent() {
    let found = offenders("set_session_token(", ALLOWED_TOKEN_WRITERS);
    assert!(
        found.is_empty(),
        "session token written outside the auth agent:\n{}",
        found.join("\n")
    );
}
