//! ビルドキャッシュイメージ

use crate::error::Result;
use crate::runtime::ContainerRuntime;
use cnbpack_builder::ImageRef;
use sha2::{Digest, Sha256};

/// アプリケーションイメージごとのキャッシュイメージ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheImage {
    name: String,
}

impl CacheImage {
    /// `pack-cache-<イメージ名の sha256 先頭12桁>`
    pub fn new(image: &ImageRef) -> Self {
        let digest = Sha256::digest(image.name().as_bytes());
        Self {
            name: format!("pack-cache-{}", &hex::encode(digest)[..12]),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// キャッシュイメージを削除（存在しなければ何もしない）
    pub async fn clear<R: ContainerRuntime>(&self, runtime: &R) -> Result<()> {
        match runtime.remove_image(&self.name).await {
            Err(e) if !e.is_not_found() => Err(e),
            _ => Ok(()),
        }
    }
}
