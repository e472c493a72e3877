//! ビルドと実行のオーケストレーション
//!
//! 入力を検証し、ビルダーとランイメージを取得して互換性を確認した上で、
//! 一時ビルダーを作成してライフサイクルに渡します。

use anyhow::{Context, bail};
use cnbpack_builder::{
    Buildpack, BuildpackMetadata, Builder, GroupBuildpack, GroupMetadata, Image, ImageFetcher,
    ImageRef, STACK_ID_LABEL, StackMetadata,
};
use cnbpack_config::Config;
use cnbpack_container::{
    AppRunner, ContainerRuntime, LifecycleExecutor, LifecycleOptions, NameGenerator,
};
use colored::Colorize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// `pack build` の入力
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// 出力イメージ名
    pub image: String,
    /// None の場合はカレントディレクトリ
    pub app_dir: Option<PathBuf>,
    /// None の場合は設定のデフォルトビルダー
    pub builder: Option<String>,
    pub run_image: Option<String>,
    pub env: BTreeMap<String, String>,
    pub publish: bool,
    pub no_pull: bool,
    pub clear_cache: bool,
    /// `id`、`id@version`、または buildpack ディレクトリ
    pub buildpacks: Vec<String>,
}

/// `pack run` の入力
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub app_dir: Option<PathBuf>,
    pub builder: Option<String>,
    pub run_image: Option<String>,
    pub env: BTreeMap<String, String>,
    pub no_pull: bool,
    pub clear_cache: bool,
    pub buildpacks: Vec<String>,
    /// 空の場合はイメージの公開ポート
    pub ports: Vec<String>,
}

/// `pack inspect-builder` で表示する情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuilderInfo {
    pub stack_id: String,
    pub run_image: String,
    /// 設定ファイルのミラー
    pub local_run_image_mirrors: Vec<String>,
    /// ビルダーメタデータのミラー
    pub run_image_mirrors: Vec<String>,
    pub buildpacks: Vec<BuildpackMetadata>,
    pub groups: Vec<GroupMetadata>,
}

/// ビルドと実行のクライアント
pub struct Client<F, L, R> {
    config: Config,
    fetcher: F,
    lifecycle: L,
    runtime: R,
    names: Arc<NameGenerator>,
}

impl<F, L, R> Client<F, L, R>
where
    F: ImageFetcher,
    L: LifecycleExecutor,
    R: ContainerRuntime + Clone,
{
    pub fn new(config: Config, fetcher: F, lifecycle: L, runtime: R) -> Self {
        Self {
            config,
            fetcher,
            lifecycle,
            runtime,
            names: Arc::new(NameGenerator::new()),
        }
    }

    /// 一時ビルダー名の生成器を差し替える
    pub fn with_names(mut self, names: Arc<NameGenerator>) -> Self {
        self.names = names;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// アプリケーションイメージをビルド
    pub async fn build(
        &self,
        token: &CancellationToken,
        opts: BuildOptions,
    ) -> anyhow::Result<()> {
        let image = ImageRef::parse_tag(&opts.image)
            .with_context(|| format!("invalid image name '{}'", opts.image))?;

        let app_dir = process_app_dir(opts.app_dir.as_deref())?;

        let builder_name = self.process_builder_name(opts.builder.as_deref())?;
        let raw_builder = self
            .fetcher
            .fetch(&builder_name, true, !opts.no_pull)
            .await
            .with_context(|| format!("failed to fetch builder image '{}'", builder_name))?;
        let builder = open_builder(raw_builder)
            .with_context(|| format!("invalid builder '{}'", builder_name))?;

        let run_image = self
            .process_run_image_name(
                opts.run_image.as_deref(),
                image.registry(),
                builder.stack_info(),
            )
            .context("invalid run-image")?;
        self.validate_run_image(&run_image, opts.publish, opts.no_pull, builder.stack_id())
            .await
            .with_context(|| format!("invalid run-image '{}'", run_image))?;

        let (buildpacks, group) =
            process_buildpacks(&opts.buildpacks, &builder).context("invalid buildpack")?;

        let ephemeral = self
            .create_ephemeral_builder(builder.into_image(), opts.env, group, buildpacks)
            .await
            .context("failed to create ephemeral builder image")?;

        self.lifecycle
            .execute(
                token,
                LifecycleOptions {
                    app_dir,
                    image,
                    builder: ephemeral,
                    run_image,
                    clear_cache: opts.clear_cache,
                    publish: opts.publish,
                },
            )
            .await?;
        Ok(())
    }

    /// アプリケーションをビルドしてコンテナとして実行
    ///
    /// イメージ名はアプリケーションディレクトリから決まる
    pub async fn run(
        &self,
        token: &CancellationToken,
        opts: RunOptions,
        output: &mut (dyn Write + Send),
    ) -> anyhow::Result<()> {
        let app_dir = process_app_dir(opts.app_dir.as_deref())?;
        let image = run_image_name(&app_dir);

        self.build(
            token,
            BuildOptions {
                image: image.clone(),
                app_dir: Some(app_dir),
                builder: opts.builder,
                run_image: opts.run_image,
                env: opts.env,
                publish: false,
                no_pull: opts.no_pull,
                clear_cache: opts.clear_cache,
                buildpacks: opts.buildpacks,
            },
        )
        .await
        .context("build failed")?;

        if token.is_cancelled() {
            return Ok(());
        }

        writeln!(output, "{}", "===> RUNNING".cyan().bold())?;
        AppRunner::new(self.runtime.clone())
            .run(token, &image, &opts.ports, output)
            .await?;
        Ok(())
    }

    /// ビルダーの情報を取得（存在しなければ None）
    ///
    /// * `daemon` - false の場合はレジストリのみを参照する
    pub async fn inspect_builder(
        &self,
        name: &str,
        daemon: bool,
    ) -> anyhow::Result<Option<BuilderInfo>> {
        let image = match self.fetcher.fetch(name, daemon, false).await {
            Ok(image) => image,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("failed to inspect '{}'", name)),
        };
        let builder =
            Builder::open(image).with_context(|| format!("invalid builder '{}'", name))?;

        let run_image = builder.stack_info().run_image.image.clone();
        let local_run_image_mirrors = self
            .config
            .run_image(&run_image)
            .map(|config| config.mirrors.clone())
            .unwrap_or_default();

        Ok(Some(BuilderInfo {
            stack_id: builder.stack_id().to_string(),
            run_image,
            local_run_image_mirrors,
            run_image_mirrors: builder.stack_info().run_image.mirrors.clone(),
            buildpacks: builder.buildpacks().to_vec(),
            groups: builder.order().to_vec(),
        }))
    }

    /// ローカル、次にレジストリの順でビルダーの存在を確認
    pub async fn builder_exists(&self, name: &str) -> anyhow::Result<bool> {
        for daemon in [true, false] {
            match self.fetcher.fetch(name, daemon, false).await {
                Ok(_) => return Ok(true),
                Err(e) if e.is_not_found() => {
                    tracing::debug!("Builder '{}' not found (daemon: {})", name, daemon);
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("failed to inspect '{}'", name));
                }
            }
        }
        Ok(false)
    }

    fn process_builder_name(&self, builder: Option<&str>) -> anyhow::Result<String> {
        let name = match builder.or(self.config.default_builder.as_deref()) {
            Some(name) => name,
            None => bail!("builder is a required parameter if the client has no default builder"),
        };
        ImageRef::parse(name).with_context(|| format!("invalid builder '{}'", name))?;
        Ok(name.to_string())
    }

    /// 明示されたランイメージ、またはレジストリに最適なミラー
    fn process_run_image_name(
        &self,
        run_image: Option<&str>,
        registry: &str,
        stack: &StackMetadata,
    ) -> anyhow::Result<ImageRef> {
        let name = match run_image {
            Some(name) => name.to_string(),
            None => {
                let local_mirrors = self
                    .config
                    .run_image(&stack.run_image.image)
                    .map(|config| config.mirrors.as_slice())
                    .unwrap_or_default();
                stack.best_mirror(registry, local_mirrors)
            }
        };
        tracing::debug!("Selected run image '{}'", name);
        Ok(ImageRef::parse(&name)?)
    }

    /// ランイメージを取得し、スタックIDがビルダーと一致するか確認
    async fn validate_run_image(
        &self,
        run_image: &ImageRef,
        publish: bool,
        no_pull: bool,
        stack_id: &str,
    ) -> anyhow::Result<()> {
        let image = self
            .fetcher
            .fetch(&run_image.name(), !publish, !no_pull)
            .await?;
        let run_stack = image.label(STACK_ID_LABEL)?.unwrap_or_default();
        if run_stack != stack_id {
            bail!(
                "run-image stack id '{}' does not match builder stack '{}'",
                run_stack,
                stack_id
            );
        }
        Ok(())
    }

    /// 元のビルダーから新しい名前で一時ビルダーを作成して保存
    async fn create_ephemeral_builder<I: Image>(
        &self,
        image: I,
        env: BTreeMap<String, String>,
        group: GroupMetadata,
        buildpacks: Vec<Buildpack>,
    ) -> anyhow::Result<Builder<I>> {
        let mut builder = Builder::new(image, &self.names.builder_image())?;
        builder.set_env(env);
        if !group.buildpacks.is_empty() {
            builder.set_order(vec![group]);
        }
        for buildpack in buildpacks {
            builder.add_buildpack(buildpack)?;
        }
        builder.save().await?;
        tracing::debug!("Created ephemeral builder '{}'", builder.name());
        Ok(builder)
    }
}

/// ビルダーを開き、ランイメージが宣言されていることを確認
fn open_builder<I: Image>(image: I) -> anyhow::Result<Builder<I>> {
    let builder = Builder::open(image)?;
    if builder.stack_info().run_image.image.is_empty() {
        bail!("builder metadata is missing runImage");
    }
    Ok(builder)
}

/// アプリケーションディレクトリを絶対パスに解決
fn process_app_dir(app_dir: Option<&Path>) -> anyhow::Result<PathBuf> {
    let dir = match app_dir {
        Some(dir) => dir.to_path_buf(),
        None => std::env::current_dir().context("invalid app dir")?,
    };
    let dir = std::path::absolute(&dir)
        .with_context(|| format!("invalid app dir '{}'", dir.display()))?;
    if !dir.is_dir() {
        bail!("invalid app dir '{}': not a directory", dir.display());
    }
    Ok(dir)
}

/// `--buildpack` の値から追加する buildpack と実行グループを作る
///
/// ディレクトリ以外はビルダー内の buildpack への参照として解決する。
/// バージョンを省略した場合は latest フラグの付いたバージョンになる
fn process_buildpacks<I: Image>(
    values: &[String],
    builder: &Builder<I>,
) -> anyhow::Result<(Vec<Buildpack>, GroupMetadata)> {
    let mut buildpacks = Vec::new();
    let mut group = GroupMetadata::default();

    for value in values {
        let path = Path::new(value);
        if Buildpack::is_buildpack_dir(path) {
            let buildpack = Buildpack::from_dir(path, false)?;
            group
                .buildpacks
                .push(GroupBuildpack::new(&buildpack.id, &buildpack.version));
            buildpacks.push(buildpack);
            continue;
        }

        let (id, version) = match value.split_once('@') {
            Some((id, version)) => (id, version),
            None => {
                tracing::debug!(
                    "No version for '{}' buildpack provided, will use '{}@latest'",
                    value,
                    value
                );
                (value.as_str(), "latest")
            }
        };
        if id.is_empty() || version.is_empty() {
            bail!("'{}' is not a valid buildpack reference", value);
        }

        let Some(found) = builder.get_buildpack(id, version) else {
            bail!(
                "buildpack '{}@{}' does not exist in builder '{}'",
                id,
                version,
                builder.name()
            );
        };
        group
            .buildpacks
            .push(GroupBuildpack::new(&found.id, &found.version));
    }

    Ok((buildpacks, group))
}

/// `pack run` のイメージ名: `pack.local/run/<アプリディレクトリの sha256 先頭16桁>`
pub fn run_image_name(app_dir: &Path) -> String {
    let digest = Sha256::digest(app_dir.to_string_lossy().as_bytes());
    format!("pack.local/run/{}", hex::encode(&digest[..8]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cnbpack_builder::{ENV_GID, ENV_UID, METADATA_LABEL, MemoryImage};

    #[test]
    fn test_run_image_name() {
        let name = run_image_name(Path::new("/some/app"));
        let suffix = name.strip_prefix("pack.local/run/").unwrap();
        assert_eq!(suffix.len(), 16);
        assert_eq!(name, run_image_name(Path::new("/some/app")));
        assert_ne!(name, run_image_name(Path::new("/other/app")));
        ImageRef::parse(&name).unwrap();
    }

    fn builder() -> Builder<MemoryImage> {
        let metadata = cnbpack_builder::BuilderMetadata {
            buildpacks: vec![
                BuildpackMetadata {
                    id: "some/bp".to_string(),
                    version: "1.2.3".to_string(),
                    latest: true,
                },
                BuildpackMetadata {
                    id: "some/bp".to_string(),
                    version: "1.0.0".to_string(),
                    latest: false,
                },
            ],
            ..Default::default()
        };
        let image = MemoryImage::new("some/builder")
            .with_env(ENV_UID, "1234")
            .with_env(ENV_GID, "4321")
            .with_label(STACK_ID_LABEL, "some.stack.id")
            .with_label(METADATA_LABEL, &metadata.encode().unwrap());
        Builder::open(image).unwrap()
    }

    #[test]
    fn test_process_buildpack_references() {
        let (buildpacks, group) = process_buildpacks(
            &["some/bp@1.0.0".to_string(), "some/bp".to_string()],
            &builder(),
        )
        .unwrap();
        assert!(buildpacks.is_empty());
        // バージョン省略時は latest のバージョンに解決される
        assert_eq!(
            group.buildpacks,
            vec![
                GroupBuildpack::new("some/bp", "1.0.0"),
                GroupBuildpack::new("some/bp", "1.2.3"),
            ]
        );
    }

    #[test]
    fn test_process_buildpack_missing_from_builder() {
        let err = process_buildpacks(&["some/bp@9.9.9".to_string()], &builder()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "buildpack 'some/bp@9.9.9' does not exist in builder 'some/builder'"
        );

        let err = process_buildpacks(&["other/bp".to_string()], &builder()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "buildpack 'other/bp@latest' does not exist in builder 'some/builder'"
        );
    }

    #[test]
    fn test_process_buildpack_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("buildpack.toml"),
            "[buildpack]\nid = \"local/bp\"\nversion = \"0.0.1\"\n\n[[stacks]]\nid = \"some.stack.id\"\n",
        )
        .unwrap();

        let value = dir.path().to_string_lossy().to_string();
        let (buildpacks, group) = process_buildpacks(&[value], &builder()).unwrap();
        assert_eq!(buildpacks.len(), 1);
        assert_eq!(buildpacks[0].id, "local/bp");
        assert_eq!(
            group.buildpacks,
            vec![GroupBuildpack::new("local/bp", "0.0.1")]
        );
    }

    #[test]
    fn test_process_buildpack_invalid_reference() {
        assert!(process_buildpacks(&["some/bp@".to_string()], &builder()).is_err());
    }

    #[test]
    fn test_process_app_dir_rejects_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file.txt");
        std::fs::write(&file, "content").unwrap();

        assert!(process_app_dir(Some(&file)).is_err());
        assert_eq!(process_app_dir(Some(dir.path())).unwrap(), dir.path());
    }
}
