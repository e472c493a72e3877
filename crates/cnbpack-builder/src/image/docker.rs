//! Docker デーモン上のイメージ
//!
//! 保存時は元イメージを `FROM` にした Dockerfile と追加レイヤーの tar を
//! ビルドコンテキストにまとめ、Docker の build API で新しいイメージを作ります。

use super::{Image, lookup_env};
use crate::error::{BuildError, BuildResult};
use bollard::Docker;
use bytes::Bytes;
use colored::Colorize;
use flate2::Compression;
use flate2::write::GzEncoder;
use futures_util::stream::StreamExt;
use http_body_util::{Either, Full};
use std::collections::HashMap;
use std::path::Path;

pub struct DockerImage {
    docker: Docker,
    name: String,
    /// 元イメージの参照（`FROM` に使う）
    base: String,
    labels: HashMap<String, String>,
    env: Vec<String>,
    layers: Vec<Vec<u8>>,
    exposed_ports: Vec<String>,
}

impl DockerImage {
    /// デーモン上のイメージを開く
    pub async fn open(docker: Docker, name: &str) -> BuildResult<Self> {
        let inspect = match docker.inspect_image(name).await {
            Ok(inspect) => inspect,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                return Err(BuildError::ImageNotFound {
                    image: name.to_string(),
                    location: "in daemon".to_string(),
                });
            }
            Err(e) => return Err(BuildError::DockerConnection(e)),
        };

        let config = inspect.config.unwrap_or_default();
        Ok(Self {
            docker,
            name: name.to_string(),
            base: name.to_string(),
            labels: config.labels.unwrap_or_default(),
            env: config.env.unwrap_or_default(),
            layers: Vec::new(),
            exposed_ports: config
                .exposed_ports
                .map(|ports| ports.into_keys().collect())
                .unwrap_or_default(),
        })
    }

    pub fn exposed_ports(&self) -> &[String] {
        &self.exposed_ports
    }

    fn dockerfile(&self) -> String {
        let mut dockerfile = format!("FROM {}\n", self.base);
        for index in 0..self.layers.len() {
            dockerfile.push_str(&format!("ADD layer-{}.tar /\n", index));
        }
        dockerfile
    }

    /// Dockerfile とレイヤー tar を含むビルドコンテキスト（tar.gz）を作成
    fn build_context(&self) -> BuildResult<Vec<u8>> {
        let mut archive_data = Vec::new();
        {
            let encoder = GzEncoder::new(&mut archive_data, Compression::default());
            let mut tar = tar::Builder::new(encoder);

            let dockerfile = self.dockerfile();
            let mut header = tar::Header::new_gnu();
            header.set_size(dockerfile.len() as u64);
            header.set_mode(0o644);
            tar.append_data(&mut header, "Dockerfile", dockerfile.as_bytes())?;

            for (index, layer) in self.layers.iter().enumerate() {
                let mut header = tar::Header::new_gnu();
                header.set_size(layer.len() as u64);
                header.set_mode(0o644);
                tar.append_data(&mut header, format!("layer-{}.tar", index), layer.as_slice())?;
            }

            tar.into_inner()?.finish()?;
        }

        tracing::debug!("Build context created: {} bytes", archive_data.len());
        Ok(archive_data)
    }

    /// ビルド出力の処理
    fn handle_build_output(&self, output: bollard::models::BuildInfo) -> BuildResult<()> {
        if let Some(stream) = output.stream {
            tracing::debug!("{}", stream.trim_end());
        }

        if let Some(error) = output.error {
            return Err(BuildError::BuildFailed(error));
        }

        if let Some(error_detail) = output.error_detail {
            let error_msg = error_detail
                .message
                .unwrap_or_else(|| "Unknown build error".to_string());
            return Err(BuildError::BuildFailed(error_msg));
        }

        if let Some(status) = output.status {
            tracing::debug!("{}", status.cyan());
        }

        Ok(())
    }
}

impl Image for DockerImage {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn label(&self, key: &str) -> BuildResult<Option<String>> {
        Ok(self.labels.get(key).cloned())
    }

    fn set_label(&mut self, key: &str, value: &str) -> BuildResult<()> {
        self.labels.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn env(&self, key: &str) -> BuildResult<Option<String>> {
        Ok(lookup_env(&self.env, key))
    }

    fn rename(&mut self, name: &str) {
        self.name = name.to_string();
    }

    fn add_layer(&mut self, tar_path: &Path) -> BuildResult<()> {
        let data = std::fs::read(tar_path).map_err(|e| BuildError::AddLayerFailed {
            artifact: tar_path.display().to_string(),
            message: e.to_string(),
        })?;
        self.layers.push(data);
        Ok(())
    }

    async fn save(&mut self) -> BuildResult<String> {
        tracing::info!("Saving image: {}", self.name);

        let context = self.build_context()?;

        #[allow(deprecated)]
        let options = bollard::image::BuildImageOptions::<String> {
            dockerfile: "Dockerfile".to_string(),
            t: self.name.clone(),
            labels: self.labels.clone(),
            rm: true,
            forcerm: true,
            pull: false, // 元イメージはローカルにある
            ..Default::default()
        };

        let body = Full::new(Bytes::from(context));
        let mut stream = self
            .docker
            .build_image(options, None, Some(Either::Left(body)));

        while let Some(msg) = stream.next().await {
            let output = msg.map_err(BuildError::DockerConnection)?;
            self.handle_build_output(output)?;
        }

        let inspect = match self.docker.inspect_image(&self.name).await {
            Ok(inspect) => inspect,
            Err(e) => return Err(discard_unsaved(&*self, e.into()).await),
        };
        let id = inspect.id.unwrap_or_default();

        // 以降の保存は新しいイメージを起点にする
        self.base = self.name.clone();
        self.layers.clear();

        tracing::info!("Successfully saved: {} ({})", self.name, id);
        Ok(id)
    }

    async fn delete(&self) -> BuildResult<()> {
        match self
            .docker
            .remove_image(
                &self.name,
                Some(bollard::query_parameters::RemoveImageOptions {
                    force: true,
                    ..Default::default()
                }),
                None,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Err(BuildError::ImageNotFound {
                image: self.name.clone(),
                location: "in daemon".to_string(),
            }),
            Err(e) => Err(BuildError::DockerConnection(e)),
        }
    }
}

/// 保存に失敗したイメージのタグを削除し、元のエラーを返す
///
/// タグの削除は失敗しても警告のみ
async fn discard_unsaved<I: Image>(image: &I, err: BuildError) -> BuildError {
    match image.delete().await {
        Err(e) if !e.is_not_found() => {
            tracing::warn!("Failed to remove unsaved image {}: {}", image.name(), e);
        }
        _ => tracing::debug!("Removed unsaved image {}", image.name()),
    }
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::MemoryImage;
    use crate::stack::STACK_ID_LABEL;

    #[tokio::test]
    async fn test_discard_unsaved_removes_tag() {
        let image = MemoryImage::new("pack.local/builder/abcdefghij");
        let err = discard_unsaved(&image, BuildError::BuildFailed("no such image".to_string()))
            .await;

        assert!(image.is_deleted());
        assert_eq!(err.to_string(), "Build failed: no such image");
    }

    #[tokio::test]
    async fn test_discard_unsaved_keeps_original_error() {
        let image =
            MemoryImage::new("pack.local/builder/abcdefghij").with_delete_error("conflict");
        let err = discard_unsaved(&image, BuildError::BuildFailed("no such image".to_string()))
            .await;

        assert!(!image.is_deleted());
        assert_eq!(err.to_string(), "Build failed: no such image");
    }

    #[tokio::test]
    #[ignore] // Docker接続が必要なため、通常のテストではスキップ
    async fn test_save_adds_layer_and_label() {
        let docker = Docker::connect_with_local_defaults().unwrap();

        crate::fetch::pull_image(&docker, "alpine:latest", None)
            .await
            .unwrap();
        let mut image = DockerImage::open(docker.clone(), "alpine:latest")
            .await
            .unwrap();
        image.rename("pack.local/test/docker-image:latest");

        let dir = tempfile::tempdir().unwrap();
        let tar_path = dir.path().join("layer.tar");
        {
            let mut builder = tar::Builder::new(std::fs::File::create(&tar_path).unwrap());
            let mut header = tar::Header::new_gnu();
            header.set_size(2);
            header.set_mode(0o644);
            builder
                .append_data(&mut header, "some-file.txt", &b"hi"[..])
                .unwrap();
            builder.finish().unwrap();
        }
        image.add_layer(&tar_path).unwrap();
        image.set_label(STACK_ID_LABEL, "some.stack.id").unwrap();

        let id = image.save().await.unwrap();
        assert!(id.starts_with("sha256:"));

        let reopened = DockerImage::open(docker, "pack.local/test/docker-image:latest")
            .await
            .unwrap();
        assert_eq!(
            reopened.label(STACK_ID_LABEL).unwrap().as_deref(),
            Some("some.stack.id")
        );

        reopened.delete().await.unwrap();
        assert!(reopened.delete().await.unwrap_err().is_not_found());
    }
}
