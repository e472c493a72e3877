//! イメージの抽象化
//!
//! ビルダーイメージの読み取りと、レイヤー・ラベルを追加した新しい
//! イメージの保存を行います。Docker デーモン上のイメージ、レジストリ上の
//! イメージ（読み取り専用）、テスト用のメモリ上のイメージを実装します。

pub mod docker;
pub mod memory;
pub mod remote;

pub use docker::DockerImage;
pub use memory::MemoryImage;
pub use remote::RemoteImage;

use crate::error::BuildResult;
use std::path::Path;

/// イメージハンドル
///
/// `set_label` / `rename` / `add_layer` はメモリ上の変更で、
/// `save` を呼ぶまで実体には反映されない
#[allow(async_fn_in_trait)]
pub trait Image {
    fn name(&self) -> String;

    /// ラベル値（存在しなければ None）
    fn label(&self, key: &str) -> BuildResult<Option<String>>;

    fn set_label(&mut self, key: &str, value: &str) -> BuildResult<()>;

    /// 環境変数値（存在しなければ None）
    fn env(&self, key: &str) -> BuildResult<Option<String>>;

    fn rename(&mut self, name: &str);

    /// tar ファイルをレイヤーとして追加
    fn add_layer(&mut self, tar_path: &Path) -> BuildResult<()>;

    /// 変更を確定し、イメージIDを返す
    async fn save(&mut self) -> BuildResult<String>;

    async fn delete(&self) -> BuildResult<()>;
}

/// `KEY=VALUE` 形式の環境変数リストから値を取得
pub(crate) fn lookup_env(env: &[String], key: &str) -> Option<String> {
    env.iter().find_map(|entry| {
        entry
            .split_once('=')
            .filter(|(k, _)| *k == key)
            .map(|(_, v)| v.to_string())
    })
}
