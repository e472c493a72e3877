//! ローカル buildpack の読み込み

use crate::error::{BuildError, BuildResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// buildpack ディレクトリに必須の記述子
pub const BUILDPACK_TOML: &str = "buildpack.toml";

/// ビルダーに追加する buildpack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buildpack {
    pub id: String,
    pub version: String,
    /// `latest` シンボリックリンクの対象にするか
    pub latest: bool,
    /// buildpack のファイルを含むディレクトリ
    pub dir: PathBuf,
    /// サポートするスタックID
    pub stacks: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct BuildpackToml {
    buildpack: BuildpackInfo,
    #[serde(default)]
    stacks: Vec<StackEntry>,
}

#[derive(Debug, Deserialize)]
struct BuildpackInfo {
    id: String,
    #[serde(default)]
    version: String,
}

#[derive(Debug, Deserialize)]
struct StackEntry {
    id: String,
}

impl Buildpack {
    /// `buildpack.toml` を含むディレクトリから読み込む
    pub fn from_dir(dir: &Path, latest: bool) -> BuildResult<Self> {
        let descriptor = dir.join(BUILDPACK_TOML);
        let content =
            std::fs::read_to_string(&descriptor).map_err(|e| BuildError::InvalidBuildpack {
                path: dir.to_path_buf(),
                message: format!("failed to read {}: {}", BUILDPACK_TOML, e),
            })?;

        let parsed: BuildpackToml =
            toml::from_str(&content).map_err(|e| BuildError::InvalidBuildpack {
                path: dir.to_path_buf(),
                message: format!("failed to parse {}: {}", BUILDPACK_TOML, e),
            })?;

        if parsed.buildpack.id.is_empty() {
            return Err(BuildError::InvalidBuildpack {
                path: dir.to_path_buf(),
                message: format!("{} must provide id", BUILDPACK_TOML),
            });
        }
        if parsed.buildpack.version.is_empty() {
            return Err(BuildError::InvalidBuildpack {
                path: dir.to_path_buf(),
                message: format!("{} must provide version", BUILDPACK_TOML),
            });
        }

        Ok(Self {
            id: parsed.buildpack.id,
            version: parsed.buildpack.version,
            latest,
            dir: dir.to_path_buf(),
            stacks: parsed.stacks.into_iter().map(|s| s.id).collect(),
        })
    }

    /// ディレクトリが buildpack かどうか
    pub fn is_buildpack_dir(path: &Path) -> bool {
        path.join(BUILDPACK_TOML).is_file()
    }

    /// レイヤーパス用のID（`/` を `_` に置換）
    pub fn escaped_id(&self) -> String {
        escape_id(&self.id)
    }

    pub fn supports_stack(&self, stack_id: &str) -> bool {
        self.stacks.iter().any(|s| s == stack_id)
    }
}

pub fn escape_id(id: &str) -> String {
    id.replace('/', "_")
}
