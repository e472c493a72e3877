//! イメージの取得（デーモン / レジストリ）

use crate::auth::RegistryAuth;
use crate::error::{BuildError, BuildResult};
use crate::image::{DockerImage, Image, RemoteImage};
use crate::progress::PullProgress;
use crate::reference::ImageRef;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use futures_util::stream::StreamExt;
use std::path::Path;

/// イメージ取得サービス
#[allow(async_fn_in_trait)]
pub trait ImageFetcher {
    type Image: Image;

    /// イメージを取得
    ///
    /// * `daemon` - false の場合はレジストリのみを参照する
    /// * `pull` - false の場合はローカルのコピーを更新しない
    async fn fetch(&self, name: &str, daemon: bool, pull: bool) -> BuildResult<Self::Image>;
}

/// デーモン上またはレジストリ上のイメージ
pub enum FetchedImage {
    Daemon(DockerImage),
    Registry(RemoteImage),
}

impl FetchedImage {
    pub fn exposed_ports(&self) -> &[String] {
        match self {
            FetchedImage::Daemon(image) => image.exposed_ports(),
            FetchedImage::Registry(image) => image.exposed_ports(),
        }
    }
}

impl Image for FetchedImage {
    fn name(&self) -> String {
        match self {
            FetchedImage::Daemon(image) => image.name(),
            FetchedImage::Registry(image) => image.name(),
        }
    }

    fn label(&self, key: &str) -> BuildResult<Option<String>> {
        match self {
            FetchedImage::Daemon(image) => image.label(key),
            FetchedImage::Registry(image) => image.label(key),
        }
    }

    fn set_label(&mut self, key: &str, value: &str) -> BuildResult<()> {
        match self {
            FetchedImage::Daemon(image) => image.set_label(key, value),
            FetchedImage::Registry(image) => image.set_label(key, value),
        }
    }

    fn env(&self, key: &str) -> BuildResult<Option<String>> {
        match self {
            FetchedImage::Daemon(image) => image.env(key),
            FetchedImage::Registry(image) => image.env(key),
        }
    }

    fn rename(&mut self, name: &str) {
        match self {
            FetchedImage::Daemon(image) => image.rename(name),
            FetchedImage::Registry(image) => image.rename(name),
        }
    }

    fn add_layer(&mut self, tar_path: &Path) -> BuildResult<()> {
        match self {
            FetchedImage::Daemon(image) => image.add_layer(tar_path),
            FetchedImage::Registry(image) => image.add_layer(tar_path),
        }
    }

    async fn save(&mut self) -> BuildResult<String> {
        match self {
            FetchedImage::Daemon(image) => image.save().await,
            FetchedImage::Registry(image) => image.save().await,
        }
    }

    async fn delete(&self) -> BuildResult<()> {
        match self {
            FetchedImage::Daemon(image) => image.delete().await,
            FetchedImage::Registry(image) => image.delete().await,
        }
    }
}

/// Docker デーモンとレジストリからイメージを取得
#[derive(Clone)]
pub struct DockerFetcher {
    docker: Docker,
    auth: RegistryAuth,
    show_progress: bool,
}

impl DockerFetcher {
    pub fn new(docker: Docker) -> Self {
        Self {
            docker,
            auth: RegistryAuth::new(),
            show_progress: true,
        }
    }

    pub fn with_auth(mut self, auth: RegistryAuth) -> Self {
        self.auth = auth;
        self
    }

    pub fn quiet(mut self) -> Self {
        self.show_progress = false;
        self
    }
}

impl ImageFetcher for DockerFetcher {
    type Image = FetchedImage;

    async fn fetch(&self, name: &str, daemon: bool, pull: bool) -> BuildResult<FetchedImage> {
        if !daemon {
            tracing::debug!("Fetching {} from registry", name);
            return Ok(FetchedImage::Registry(
                RemoteImage::fetch(name, &self.auth).await?,
            ));
        }

        if pull {
            let credentials = self.auth.get_credentials(name)?;
            let progress = if self.show_progress {
                PullProgress::new(name)
            } else {
                PullProgress::hidden()
            };
            match pull_with_progress(&self.docker, name, credentials, &progress).await {
                Ok(()) => progress.finish_success(name),
                Err(e) => {
                    progress.finish_error(&e.to_string());
                    return Err(e);
                }
            }
        }

        Ok(FetchedImage::Daemon(
            DockerImage::open(self.docker.clone(), name).await?,
        ))
    }
}

/// イメージを pull
pub async fn pull_image(
    docker: &Docker,
    image: &str,
    credentials: Option<DockerCredentials>,
) -> BuildResult<()> {
    pull_with_progress(docker, image, credentials, &PullProgress::hidden()).await
}

async fn pull_with_progress(
    docker: &Docker,
    image: &str,
    credentials: Option<DockerCredentials>,
    progress: &PullProgress,
) -> BuildResult<()> {
    let reference = ImageRef::parse(image)?;

    #[allow(deprecated)]
    let options = bollard::image::CreateImageOptions {
        from_image: reference.context(),
        tag: reference.identifier().to_string(),
        ..Default::default()
    };

    #[allow(deprecated)]
    let mut stream = docker.create_image(Some(options), None, credentials);

    while let Some(info) = stream.next().await {
        match info {
            Ok(bollard::models::CreateImageInfo {
                status: Some(status),
                progress: Some(detail),
                ..
            }) => {
                progress.set_message(&format!("{}: {}", status, detail));
            }
            Ok(bollard::models::CreateImageInfo {
                status: Some(status),
                ..
            }) => {
                progress.set_message(&status);
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                return Err(BuildError::ImageNotFound {
                    image: image.to_string(),
                    location: "in registry".to_string(),
                });
            }
            Err(e) => {
                return Err(BuildError::RegistryFailed {
                    image: image.to_string(),
                    message: e.to_string(),
                });
            }
            _ => {}
        }
    }

    Ok(())
}
