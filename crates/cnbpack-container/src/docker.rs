//! Docker デーモンを使ったコンテナランタイム

// Bollard 0.19 の非推奨APIを一時的に使用
#![allow(deprecated)]

use crate::error::{ContainerError, Result};
use crate::runtime::{ContainerRuntime, ContainerSpec};
use bollard::Docker;
use bollard::container::{Config, LogOutput, LogsOptions};
use bollard::models::{HostConfig, PortBinding, VolumeCreateOptions};
use bollard::query_parameters::{
    RemoveContainerOptions, RemoveImageOptions, RemoveVolumeOptions, StartContainerOptions,
    UploadToContainerOptions, WaitContainerOptions,
};
use bytes::Bytes;
use futures_util::stream::StreamExt;
use http_body_util::{Either, Full};
use std::collections::HashMap;
use std::io::Write;

/// Docker ソケットのパス
pub const DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// bollard による ContainerRuntime 実装
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }
}

/// ContainerSpec を Docker のコンテナ設定に変換
fn container_config(spec: &ContainerSpec) -> Config<String> {
    let mut port_bindings = HashMap::new();
    let mut exposed_ports = HashMap::new();

    for port in &spec.ports {
        let key = port.container_key();
        exposed_ports.insert(key.clone(), HashMap::new());
        port_bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: Some(port.host_ip.clone()),
                host_port: Some(port.host_port.to_string()),
            }]),
        );
    }

    let host_config = HostConfig {
        binds: (!spec.binds.is_empty()).then(|| spec.binds.clone()),
        network_mode: spec.network_mode.clone(),
        port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
        ..Default::default()
    };

    Config {
        image: Some(spec.image.clone()),
        cmd: (!spec.cmd.is_empty()).then(|| spec.cmd.clone()),
        env: (!spec.env.is_empty()).then(|| spec.env.clone()),
        user: spec.user.clone(),
        exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        host_config: Some(host_config),
        ..Default::default()
    }
}

impl ContainerRuntime for DockerRuntime {
    async fn create_volume(&self, name: &str) -> Result<()> {
        tracing::debug!("Creating volume {}", name);
        self.docker
            .create_volume(VolumeCreateOptions {
                name: Some(name.to_string()),
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        tracing::debug!("Removing volume {}", name);
        match self
            .docker
            .remove_volume(name, None::<RemoveVolumeOptions>)
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Err(ContainerError::NotFound {
                kind: "volume",
                name: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let response = match self
            .docker
            .create_container(
                None::<bollard::query_parameters::CreateContainerOptions>,
                container_config(spec),
            )
            .await
        {
            Ok(response) => response,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                return Err(ContainerError::ImageNotFound {
                    image: spec.image.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        for warning in &response.warnings {
            tracing::warn!("{}", warning);
        }
        tracing::debug!("Created container {} from {}", response.id, spec.image);
        Ok(response.id)
    }

    async fn copy_to_container(&self, id: &str, dest: &str, archive: Vec<u8>) -> Result<()> {
        let options = UploadToContainerOptions {
            path: dest.to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(
                id,
                Some(options),
                Either::Left(Full::new(Bytes::from(archive))),
            )
            .await?;
        Ok(())
    }

    async fn run_container(&self, id: &str, output: &mut (dyn Write + Send)) -> Result<i64> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await?;

        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut logs = self.docker.logs(id, Some(options));
        while let Some(log) = logs.next().await {
            match log? {
                LogOutput::StdOut { message }
                | LogOutput::StdErr { message }
                | LogOutput::Console { message } => output.write_all(&message)?,
                LogOutput::StdIn { .. } => {}
            }
        }
        output.flush()?;

        let mut wait = self.docker.wait_container(id, None::<WaitContainerOptions>);
        let mut exit_code = 0;
        while let Some(result) = wait.next().await {
            match result {
                Ok(response) => exit_code = response.status_code,
                Err(bollard::errors::Error::DockerContainerWaitError { code, .. }) => {
                    exit_code = code
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(exit_code)
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Err(ContainerError::NotFound {
                kind: "container",
                name: id.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_image(&self, name: &str) -> Result<()> {
        tracing::debug!("Removing image {}", name);
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_image(name, Some(options), None).await {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Err(ContainerError::ImageNotFound {
                image: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn image_exposed_ports(&self, image: &str) -> Result<Vec<String>> {
        let inspect = match self.docker.inspect_image(image).await {
            Ok(inspect) => inspect,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                return Err(ContainerError::ImageNotFound {
                    image: image.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let mut ports: Vec<String> = inspect
            .config
            .and_then(|config| config.exposed_ports)
            .map(|ports| ports.into_keys().collect())
            .unwrap_or_default();
        ports.sort();
        Ok(ports)
    }
}
