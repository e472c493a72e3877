use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("ホームディレクトリが見つかりません（PACK_HOME を設定してください）")]
    HomeDirNotFound,

    #[error("設定ファイルを読み込めません: {path}\n理由: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("設定のシリアライズに失敗しました: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("IO エラー: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
