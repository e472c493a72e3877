//! ビルドライフサイクル
//!
//! 一時ビルダーイメージ上で detect → restore → analyze → build → export → cache
//! の各フェーズを順にコンテナとして実行します。フェーズ間の状態は
//! レイヤーボリューム（`/layers`）とアプリボリューム（`/workspace`）で共有します。

use crate::cache::CacheImage;
use crate::error::{ContainerError, Result};
use crate::naming::NameGenerator;
use crate::output::SharedBuffer;
use crate::phase::Phase;
use crate::runtime::ContainerRuntime;
use cnbpack_builder::{Builder, Image, ImageRef, RegistryAuth, dir_archive};
use colored::Colorize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const LAYERS_DIR: &str = "/layers";
pub const WORKSPACE_DIR: &str = "/workspace";

const GROUP_PATH: &str = "/layers/group.toml";
const PLAN_PATH: &str = "/layers/plan.toml";

/// 1回のビルドの実行設定
pub struct LifecycleOptions<I> {
    pub app_dir: PathBuf,
    pub image: ImageRef,
    /// 保存済みの一時ビルダー（ビルド後に削除される）
    pub builder: Builder<I>,
    pub run_image: ImageRef,
    pub clear_cache: bool,
    pub publish: bool,
}

/// ライフサイクルの実行サービス
#[allow(async_fn_in_trait)]
pub trait LifecycleExecutor {
    async fn execute<I: Image>(
        &self,
        token: &CancellationToken,
        options: LifecycleOptions<I>,
    ) -> Result<()>;
}

/// 1回のビルドで使うボリュームと一時ビルダーを所有する
pub struct Lifecycle<R, I> {
    runtime: R,
    builder: Builder<I>,
    auth: RegistryAuth,
    layers_volume: String,
    app_volume: String,
    app_dir: PathBuf,
    /// アプリケーションを app ボリュームにコピー済みか
    app_copied: bool,
    output: Box<dyn Write + Send>,
}

impl<R, I> Lifecycle<R, I>
where
    R: ContainerRuntime + Clone,
    I: Image,
{
    pub fn new(
        runtime: R,
        builder: Builder<I>,
        app_dir: &Path,
        names: &NameGenerator,
        auth: RegistryAuth,
        output: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            runtime,
            builder,
            auth,
            layers_volume: names.layers_volume(),
            app_volume: names.app_volume(),
            app_dir: app_dir.to_path_buf(),
            app_copied: false,
            output,
        }
    }

    pub fn layers_volume(&self) -> &str {
        &self.layers_volume
    }

    pub fn app_volume(&self) -> &str {
        &self.app_volume
    }

    pub fn builder(&self) -> &Builder<I> {
        &self.builder
    }

    /// レイヤーボリュームとアプリボリュームを作成
    pub async fn setup(&self) -> Result<()> {
        self.runtime.create_volume(&self.layers_volume).await?;
        self.runtime.create_volume(&self.app_volume).await?;
        Ok(())
    }

    /// ボリュームをマウントしたフェーズを作る
    ///
    /// アプリケーションのコピーが済むまでは、作られたフェーズがコピーを持つ
    pub fn new_phase(&self, name: &str) -> Result<Phase<R>> {
        let phase = Phase::new(self.runtime.clone(), name, &self.builder.name()).with_binds([
            format!("{}:{}", self.layers_volume, LAYERS_DIR),
            format!("{}:{}", self.app_volume, WORKSPACE_DIR),
        ]);

        if self.app_copied {
            return Ok(phase);
        }
        let archive = dir_archive(
            &self.app_dir,
            WORKSPACE_DIR.trim_start_matches('/'),
            self.builder.uid(),
            self.builder.gid(),
        )?;
        Ok(phase.with_app_archive(archive))
    }

    /// フェーズを実行し、成否にかかわらずコンテナを削除する
    pub async fn run_phase(
        &mut self,
        token: &CancellationToken,
        mut phase: Phase<R>,
    ) -> Result<()> {
        let result = phase.run(token, &mut *self.output).await;
        if phase.app_copied() {
            self.app_copied = true;
        }
        let cleanup = phase.cleanup().await;
        result.and(cleanup)
    }

    /// 全フェーズを順に実行（失敗したフェーズで中断）
    pub async fn execute(
        &mut self,
        token: &CancellationToken,
        image: &ImageRef,
        run_image: &ImageRef,
        clear_cache: bool,
        publish: bool,
    ) -> Result<()> {
        let cache = CacheImage::new(image);
        if clear_cache {
            cache.clear(&self.runtime).await?;
            tracing::debug!("Cache image {} cleared", cache.name());
        }

        self.step("DETECTING")?;
        self.detect(token).await?;

        self.step("RESTORING")?;
        if clear_cache {
            writeln!(self.output, "Skipping 'restore' due to clearing cache")?;
        } else {
            self.restore(token, &cache).await?;
        }

        self.step("ANALYZING")?;
        if clear_cache {
            writeln!(self.output, "Skipping 'analyze' due to clearing cache")?;
        } else {
            self.analyze(token, image, publish).await?;
        }

        self.step("BUILDING")?;
        self.build(token).await?;

        self.step("EXPORTING")?;
        self.export(token, image, run_image, publish).await?;

        self.step("CACHING")?;
        self.cache(token, &cache).await?;

        Ok(())
    }

    pub async fn detect(&mut self, token: &CancellationToken) -> Result<()> {
        let phase = self.new_phase("detector")?.with_args([
            "-app",
            WORKSPACE_DIR,
            "-group",
            GROUP_PATH,
            "-plan",
            PLAN_PATH,
        ]);
        self.run_phase(token, phase).await
    }

    pub async fn restore(&mut self, token: &CancellationToken, cache: &CacheImage) -> Result<()> {
        let phase = self
            .new_phase("restorer")?
            .with_args([
                "-image",
                cache.name(),
                "-group",
                GROUP_PATH,
                "-layers",
                LAYERS_DIR,
            ])
            .with_daemon_access();
        self.run_phase(token, phase).await
    }

    pub async fn analyze(
        &mut self,
        token: &CancellationToken,
        image: &ImageRef,
        publish: bool,
    ) -> Result<()> {
        let name = image.name();
        let phase = self.new_phase("analyzer")?.with_args([
            "-layers",
            LAYERS_DIR,
            "-group",
            GROUP_PATH,
            "-helpers=false",
        ]);
        let phase = if publish {
            phase
                .with_registry_access(&self.auth, &[name.as_str()])?
                .with_args([name.as_str()])
        } else {
            phase.with_daemon_access().with_args(["-daemon", name.as_str()])
        };
        self.run_phase(token, phase).await
    }

    pub async fn build(&mut self, token: &CancellationToken) -> Result<()> {
        let phase = self.new_phase("builder")?.with_args([
            "-layers",
            LAYERS_DIR,
            "-app",
            WORKSPACE_DIR,
            "-group",
            GROUP_PATH,
            "-plan",
            PLAN_PATH,
        ]);
        self.run_phase(token, phase).await
    }

    pub async fn export(
        &mut self,
        token: &CancellationToken,
        image: &ImageRef,
        run_image: &ImageRef,
        publish: bool,
    ) -> Result<()> {
        let name = image.name();
        let run_name = run_image.name();
        let phase = self.new_phase("exporter")?.with_args([
            "-image",
            run_name.as_str(),
            "-layers",
            LAYERS_DIR,
            "-app",
            WORKSPACE_DIR,
            "-group",
            GROUP_PATH,
            "-helpers=false",
        ]);
        let phase = if publish {
            phase
                .with_registry_access(&self.auth, &[name.as_str(), run_name.as_str()])?
                .with_args([name.as_str()])
        } else {
            phase.with_daemon_access().with_args(["-daemon", name.as_str()])
        };
        self.run_phase(token, phase).await
    }

    pub async fn cache(&mut self, token: &CancellationToken, cache: &CacheImage) -> Result<()> {
        let phase = self
            .new_phase("cacher")?
            .with_args([
                "-image",
                cache.name(),
                "-group",
                GROUP_PATH,
                "-layers",
                LAYERS_DIR,
            ])
            .with_daemon_access();
        self.run_phase(token, phase).await
    }

    /// 一時ビルダーイメージと両ボリュームを削除
    ///
    /// 存在しないものは無視し、それ以外の失敗はすべてまとめて返す
    pub async fn cleanup(&self) -> Result<()> {
        let mut failures = Vec::new();

        if let Err(e) = self.builder.image().delete().await
            && !e.is_not_found()
        {
            failures.push(format!(
                "ビルダーイメージ {} を削除できません: {}",
                self.builder.name(),
                e
            ));
        }

        for (kind, volume) in [
            ("layers", &self.layers_volume),
            ("app", &self.app_volume),
        ] {
            if let Err(e) = self.runtime.remove_volume(volume).await
                && !e.is_not_found()
            {
                failures.push(format!(
                    "{} ボリューム {} を削除できません: {}",
                    kind, volume, e
                ));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ContainerError::CleanupFailed(failures))
        }
    }

    fn step(&mut self, name: &str) -> Result<()> {
        writeln!(self.output, "{}", format!("===> {}", name).cyan().bold())?;
        Ok(())
    }
}

/// コンテナランタイム上でライフサイクルを実行する LifecycleExecutor
pub struct LifecycleRunner<R> {
    runtime: R,
    auth: RegistryAuth,
    names: Arc<NameGenerator>,
    /// None の場合は標準出力
    output: Option<SharedBuffer>,
}

impl<R: ContainerRuntime + Clone> LifecycleRunner<R> {
    pub fn new(runtime: R) -> Self {
        Self {
            runtime,
            auth: RegistryAuth::new(),
            names: Arc::new(NameGenerator::new()),
            output: None,
        }
    }

    pub fn with_auth(mut self, auth: RegistryAuth) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_names(mut self, names: Arc<NameGenerator>) -> Self {
        self.names = names;
        self
    }

    /// フェーズの出力を標準出力の代わりにバッファへ書き込む
    pub fn with_output(mut self, output: SharedBuffer) -> Self {
        self.output = Some(output);
        self
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }
}

impl<R: ContainerRuntime + Clone> LifecycleExecutor for LifecycleRunner<R> {
    async fn execute<I: Image>(
        &self,
        token: &CancellationToken,
        options: LifecycleOptions<I>,
    ) -> Result<()> {
        let output: Box<dyn Write + Send> = match &self.output {
            Some(buffer) => Box::new(buffer.clone()),
            None => Box::new(std::io::stdout()),
        };
        let mut lifecycle = Lifecycle::new(
            self.runtime.clone(),
            options.builder,
            &options.app_dir,
            &self.names,
            self.auth.clone(),
            output,
        );

        let result = match lifecycle.setup().await {
            Ok(()) => {
                lifecycle
                    .execute(
                        token,
                        &options.image,
                        &options.run_image,
                        options.clear_cache,
                        options.publish,
                    )
                    .await
            }
            Err(e) => Err(e),
        };

        // キャンセルや失敗時も必ず後片付けする
        let cleanup = lifecycle.cleanup().await;
        match (result, cleanup) {
            (Err(e), Err(cleanup_err)) => {
                tracing::warn!("{}", cleanup_err);
                Err(e)
            }
            (result, cleanup) => result.and(cleanup),
        }
    }
}
