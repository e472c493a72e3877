//! ビルド時環境変数の解析

use anyhow::Context;
use std::collections::BTreeMap;
use std::path::Path;

/// `--env-file` と `--env` からビルド時環境変数を組み立てる
///
/// ファイルを先に読み、フラグの値で上書きする
pub fn parse_env(
    env_file: Option<&Path>,
    env: &[String],
) -> anyhow::Result<BTreeMap<String, String>> {
    let mut vars = match env_file {
        Some(path) => parse_env_file(path)?,
        None => BTreeMap::new(),
    };
    for entry in env {
        let (key, value) = parse_entry(entry);
        vars.insert(key, value);
    }
    Ok(vars)
}

/// 1行1変数のファイルを読む（空行は無視）
pub fn parse_env_file(path: &Path) -> anyhow::Result<BTreeMap<String, String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to parse env file '{}'", path.display()))?;

    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(parse_entry)
        .collect())
}

/// `KEY=VALUE`、または現在のプロセスから値を引き継ぐ `KEY`
fn parse_entry(entry: &str) -> (String, String) {
    match entry.split_once('=') {
        Some((key, value)) => (key.to_string(), value.to_string()),
        None => (
            entry.to_string(),
            std::env::var(entry).unwrap_or_default(),
        ),
    }
}
