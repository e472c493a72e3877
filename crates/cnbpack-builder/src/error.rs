use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("image '{image}' missing required env var '{key}'")]
    MissingEnv { image: String, key: String },

    #[error("failed to parse '{key}', value '{value}' should be an integer")]
    InvalidEnv { key: String, value: String },

    #[error("image '{image}' missing '{label}' label")]
    MissingLabel { image: String, label: String },

    #[error("builder '{image}' missing label '{label}' -- try recreating builder")]
    MissingMetadata { image: String, label: String },

    #[error("failed to parse metadata for builder '{image}': {source}")]
    MalformedMetadata {
        image: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("buildpack '{id}:{version}' does not support stack '{stack}'")]
    UnsupportedStack {
        id: String,
        version: String,
        stack: String,
    },

    #[error("invalid buildpack at {path}: {message}")]
    InvalidBuildpack { path: PathBuf, message: String },

    #[error("'{reference}' is not a valid image reference: {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("failed to create {artifact} layer: {message}")]
    LayerFailed { artifact: String, message: String },

    #[error("failed to add {artifact} layer: {message}")]
    AddLayerFailed { artifact: String, message: String },

    #[error("failed to encode {document}: {message}")]
    EncodeFailed { document: String, message: String },

    #[error("image '{image}' does not exist {location}")]
    ImageNotFound { image: String, location: String },

    #[error("image '{0}' is read-only")]
    ReadOnlyImage(String),

    #[error("registry request failed for '{image}': {message}")]
    RegistryFailed { image: String, message: String },

    #[error("Authentication failed for {registry}: {message}")]
    AuthFailed { registry: String, message: String },

    #[error("Docker connection error: {0}")]
    DockerConnection(#[from] bollard::errors::Error),

    #[error("Build failed: {0}")]
    BuildFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BuildError {
    /// イメージが存在しないことを示すエラーか
    pub fn is_not_found(&self) -> bool {
        match self {
            BuildError::ImageNotFound { .. } => true,
            BuildError::DockerConnection(bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            }) => true,
            _ => false,
        }
    }

    /// ユーザー向けの分かりやすいエラーメッセージ
    pub fn user_message(&self) -> String {
        match self {
            BuildError::MissingEnv { image, key } => {
                format!(
                    "ビルダーイメージ {} に必須の環境変数 {} がありません\n\
                     \n\
                     CNB_USER_ID / CNB_GROUP_ID を設定したビルダーを使用してください",
                    image, key
                )
            }
            BuildError::MissingMetadata { image, .. } => {
                format!(
                    "ビルダー {} にメタデータがありません\n\
                     \n\
                     ビルダーイメージを作り直してください",
                    image
                )
            }
            BuildError::UnsupportedStack { id, stack, .. } => {
                format!(
                    "buildpack {} はスタック {} をサポートしていません\n\
                     \n\
                     buildpack.toml の [[stacks]] を確認してください",
                    id, stack
                )
            }
            BuildError::ImageNotFound { image, .. } => {
                format!(
                    "イメージが見つかりません: {}\n\
                     \n\
                     イメージ名とタグを確認してください",
                    image
                )
            }
            _ => format!("{}", self),
        }
    }
}

pub type BuildResult<T> = std::result::Result<T, BuildError>;
pub type Result<T> = BuildResult<T>;
