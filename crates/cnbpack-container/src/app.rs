//! ビルドしたアプリケーションイメージの実行

use crate::error::{ContainerError, Result};
use crate::runtime::{ContainerRuntime, ContainerSpec, PortMapping};
use std::io::Write;
use tokio_util::sync::CancellationToken;

/// アプリケーションイメージをコンテナとして実行
pub struct AppRunner<R> {
    runtime: R,
}

impl<R: ContainerRuntime> AppRunner<R> {
    pub fn new(runtime: R) -> Self {
        Self { runtime }
    }

    /// 公開ポートを決定
    ///
    /// 指定がなければイメージの公開ポートをそのままホストに割り当てる
    pub async fn port_mappings(&self, image: &str, ports: &[String]) -> Result<Vec<PortMapping>> {
        let ports = if ports.is_empty() {
            self.runtime.image_exposed_ports(image).await?
        } else {
            ports.to_vec()
        };
        ports.iter().map(|port| PortMapping::parse(port)).collect()
    }

    /// コンテナを起動し、終了するかキャンセルされるまで出力を流す
    ///
    /// コンテナはどちらの場合も削除する
    pub async fn run(
        &self,
        token: &CancellationToken,
        image: &str,
        ports: &[String],
        output: &mut (dyn Write + Send),
    ) -> Result<()> {
        let mut spec = ContainerSpec::new(image);
        spec.ports = self.port_mappings(image, ports).await?;
        for port in &spec.ports {
            tracing::debug!(
                "Publishing {}:{} -> {}",
                port.host_ip,
                port.host_port,
                port.container_key()
            );
        }

        let id = self.runtime.create_container(&spec).await?;
        let exit_code = tokio::select! {
            _ = token.cancelled() => None,
            result = self.runtime.run_container(&id, output) => Some(result),
        };

        let removed = match self.runtime.remove_container(&id).await {
            Err(e) if !e.is_not_found() => Err(e),
            _ => Ok(()),
        };

        match exit_code {
            None => {
                tracing::debug!("Stopped application container {}", id);
                removed
            }
            Some(result) => match result? {
                0 => removed,
                exit_code => Err(ContainerError::AppFailed {
                    image: image.to_string(),
                    exit_code,
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRuntime;
    use crate::output::SharedBuffer;
    use std::time::Duration;

    #[tokio::test]
    async fn test_defaults_to_exposed_ports() {
        let runtime = MemoryRuntime::new().with_image("pack.local/run/app", &["8080/tcp"]);
        let runner = AppRunner::new(runtime);

        let ports = runner
            .port_mappings("pack.local/run/app", &[])
            .await
            .unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!((ports[0].host_port, ports[0].container_port), (8080, 8080));

        let ports = runner
            .port_mappings("pack.local/run/app", &["3000:8080".to_string()])
            .await
            .unwrap();
        assert_eq!(ports[0].host_port, 3000);
    }

    #[tokio::test]
    async fn test_run_streams_output_and_removes_container() {
        let runtime = MemoryRuntime::with_handler(|_, _, out| {
            writeln!(out, "listening").unwrap();
            0
        })
        .with_image("pack.local/run/app", &[]);
        let runner = AppRunner::new(runtime.clone());
        let mut out = SharedBuffer::new();

        runner
            .run(
                &CancellationToken::new(),
                "pack.local/run/app",
                &[],
                &mut out,
            )
            .await
            .unwrap();

        assert_eq!(out.contents(), "listening\n");
        assert_eq!(runtime.live_containers(), 0);
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_error() {
        let runtime = MemoryRuntime::with_handler(|_, _, _| 2);
        let runner = AppRunner::new(runtime.clone());
        let mut out = SharedBuffer::new();

        let err = runner
            .run(
                &CancellationToken::new(),
                "pack.local/run/app",
                &["8080".to_string()],
                &mut out,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ContainerError::AppFailed { exit_code: 2, .. }));
        assert_eq!(runtime.live_containers(), 0);
    }

    #[tokio::test]
    async fn test_cancel_stops_app() {
        let runtime = MemoryRuntime::new().hang_on("pack.local/run/app");
        let runner = AppRunner::new(runtime.clone());
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let mut out = SharedBuffer::new();
        runner
            .run(&token, "pack.local/run/app", &["8080".to_string()], &mut out)
            .await
            .unwrap();
        assert_eq!(runtime.live_containers(), 0);
    }
}
