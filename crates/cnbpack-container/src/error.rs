use cnbpack_builder::BuildError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error(
        "Dockerに接続できません: {0}\n\nヒント:\n  • Dockerが起動しているか確認してください\n  • docker ps コマンドが正常に動作するか確認してください"
    )]
    DockerConnectionFailed(String),

    #[error("{kind} '{name}' が見つかりません")]
    NotFound { kind: &'static str, name: String },

    #[error(
        "イメージ '{image}' が見つかりません\n\nヒント:\n  • イメージ名とタグを確認してください\n  • docker pull {image} でイメージをダウンロードしてください"
    )]
    ImageNotFound { image: String },

    #[error("Docker APIエラー: {0}")]
    DockerApiError(String),

    #[error("{phase} フェーズが失敗しました (終了ステータス {exit_code})")]
    PhaseFailed { phase: String, exit_code: i64 },

    #[error("'{image}' のアプリケーションコンテナが終了ステータス {exit_code} で終了しました")]
    AppFailed { image: String, exit_code: i64 },

    #[error("{phase} フェーズは中断されました")]
    Cancelled { phase: String },

    #[error(
        "ビルドリソースの削除に失敗しました:\n  {}\n\nヒント:\n  • docker volume ls と docker images で残ったリソースを確認してください",
        .0.join("\n  ")
    )]
    CleanupFailed(Vec<String>),

    #[error(
        "ポート指定 '{0}' が不正です\n\nヒント:\n  • [ip:]host:container[/protocol] の形式で指定してください"
    )]
    InvalidPort(String),

    #[error(transparent)]
    Builder(#[from] BuildError),

    #[error("IOエラー: {0}")]
    Io(#[from] std::io::Error),
}

impl ContainerError {
    pub fn is_not_found(&self) -> bool {
        match self {
            ContainerError::NotFound { .. } | ContainerError::ImageNotFound { .. } => true,
            ContainerError::Builder(e) => e.is_not_found(),
            _ => false,
        }
    }
}

impl From<bollard::errors::Error> for ContainerError {
    fn from(err: bollard::errors::Error) -> Self {
        match &err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => ContainerError::NotFound {
                kind: "resource",
                name: message.clone(),
            },
            _ => {
                // 接続エラーの可能性をチェック
                let err_str = err.to_string();
                if err_str.contains("Connection refused")
                    || err_str.contains("No such file or directory")
                {
                    ContainerError::DockerConnectionFailed(err_str)
                } else {
                    ContainerError::DockerApiError(err_str)
                }
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, ContainerError>;
