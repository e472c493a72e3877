//! ライフサイクルフェーズ
//!
//! ビルダーイメージ内の `/lifecycle/<name>` を1つのコンテナとして実行します。
//! フェーズは使い捨てで、`run` でコンテナを作成し `cleanup` で削除します。

use crate::docker::DOCKER_SOCKET;
use crate::error::{ContainerError, Result};
use crate::output::PrefixWriter;
use crate::runtime::{ContainerRuntime, ContainerSpec};
use cnbpack_builder::{REGISTRY_AUTH_ENV, RegistryAuth};
use std::io::Write;
use tokio_util::sync::CancellationToken;

/// ライフサイクルバイナリの配置ディレクトリ
pub const LIFECYCLE_DIR: &str = "/lifecycle";

pub struct Phase<R> {
    runtime: R,
    name: String,
    spec: ContainerSpec,
    /// 起動前に `/` へ展開するアーカイブ
    app_archive: Option<Vec<u8>>,
    app_copied: bool,
    container: Option<String>,
}

impl<R: ContainerRuntime> Phase<R> {
    pub fn new(runtime: R, name: &str, image: &str) -> Self {
        let mut spec = ContainerSpec::new(image);
        spec.cmd = vec![format!("{}/{}", LIFECYCLE_DIR, name)];
        Self {
            runtime,
            name: name.to_string(),
            spec,
            app_archive: None,
            app_copied: false,
            container: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &ContainerSpec {
        &self.spec
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.cmd.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_binds<I, S>(mut self, binds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.binds.extend(binds.into_iter().map(Into::into));
        self
    }

    /// ホストの Docker ソケットをマウントし、root で実行する
    pub fn with_daemon_access(mut self) -> Self {
        self.spec
            .binds
            .push(format!("{}:{}", DOCKER_SOCKET, DOCKER_SOCKET));
        self.spec.user = Some("root".to_string());
        self
    }

    /// `repos` のレジストリ認証情報を渡し、ホストネットワークで実行する
    pub fn with_registry_access(mut self, auth: &RegistryAuth, repos: &[&str]) -> Result<Self> {
        let value = auth.registry_auth_env(repos)?;
        self.spec
            .env
            .push(format!("{}={}", REGISTRY_AUTH_ENV, value));
        self.spec.network_mode = Some("host".to_string());
        Ok(self)
    }

    /// アプリケーションのアーカイブを起動前にコピーする
    pub fn with_app_archive(mut self, archive: Vec<u8>) -> Self {
        self.app_archive = Some(archive);
        self
    }

    pub fn has_app_archive(&self) -> bool {
        self.app_archive.is_some()
    }

    /// アーカイブのコンテナへのコピーが完了したか
    pub fn app_copied(&self) -> bool {
        self.app_copied
    }

    /// コンテナを作成して実行し、終了を待つ
    ///
    /// 出力は各行に `[<name>] ` を付けて `output` に書き込む。
    /// キャンセルされた場合はコンテナを削除してから返る
    pub async fn run(
        &mut self,
        token: &CancellationToken,
        output: &mut (dyn Write + Send),
    ) -> Result<()> {
        let id = self.runtime.create_container(&self.spec).await?;
        self.container = Some(id.clone());
        tracing::debug!("Running {} phase in container {}", self.name, id);

        if let Some(archive) = self.app_archive.take() {
            self.runtime.copy_to_container(&id, "/", archive).await?;
            self.app_copied = true;
        }

        let mut prefixed = PrefixWriter::new(&self.name, output);
        let exit_code = tokio::select! {
            _ = token.cancelled() => None,
            result = self.runtime.run_container(&id, &mut prefixed) => Some(result),
        };
        drop(prefixed);

        match exit_code {
            None => {
                tracing::debug!("Cancelled {} phase, removing container {}", self.name, id);
                self.cleanup().await?;
                Err(ContainerError::Cancelled {
                    phase: self.name.clone(),
                })
            }
            Some(result) => match result? {
                0 => Ok(()),
                exit_code => Err(ContainerError::PhaseFailed {
                    phase: self.name.clone(),
                    exit_code,
                }),
            },
        }
    }

    /// コンテナを削除する（何度呼んでもよい）
    pub async fn cleanup(&mut self) -> Result<()> {
        let Some(id) = self.container.take() else {
            return Ok(());
        };
        match self.runtime.remove_container(&id).await {
            Err(e) if !e.is_not_found() => Err(e),
            _ => Ok(()),
        }
    }
}
