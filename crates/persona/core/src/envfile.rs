//! Dotenv and `.gitignore` emission for the build persona.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Quote a value for a double-quoted dotenv assignment.
pub fn quote_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '\\' | '"' | '$' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// One `NAME="<json>"` line per secret, sorted by name.
pub fn render_env(secrets: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (name, json) in secrets {
        let _ = writeln!(out, "{name}={}", quote_value(json));
    }
    out
}

pub fn write_env_file(path: &Path, secrets: &BTreeMap<String, String>) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, render_env(secrets))
}

/// Ignore the generated files that live under `build_dir`, relative to it.
pub fn render_gitignore(build_dir: &Path, generated: &[PathBuf]) -> String {
    let mut entries: Vec<String> = generated
        .iter()
        .filter_map(|p| p.strip_prefix(build_dir).ok())
        .map(|rel| format!("/{}", rel.to_string_lossy().replace('\\', "/")))
        .collect();
    entries.sort();
    entries.dedup();
    let mut out = String::new();
    for entry in entries {
        out.push_str(&entry);
        out.push('\n');
    }
    out
}

pub fn write_gitignore(build_dir: &Path, generated: &[PathBuf]) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(build_dir)?;
    let path = build_dir.join(".gitignore");
    std::fs::write(&path, render_gitignore(build_dir, generated))?;
    Ok(path)
}
