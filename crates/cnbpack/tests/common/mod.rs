#![allow(dead_code)]

use cnbpack::Client;
use cnbpack_builder::{
    BuildError, BuildResult, BuilderMetadata, BuildpackMetadata, ENV_GID, ENV_UID, GroupBuildpack,
    GroupMetadata, Image, ImageFetcher, ImageRef, METADATA_LABEL, MemoryImage, RunImageMetadata,
    STACK_ID_LABEL, StackMetadata,
};
use cnbpack_config::Config;
use cnbpack_container::{LifecycleExecutor, LifecycleOptions, MemoryRuntime, NameGenerator};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

pub const STACK_ID: &str = "some.stack.id";

/// 登録済みのイメージを返し、呼び出しを記録する ImageFetcher
///
/// クローンは状態を共有する
#[derive(Clone, Default)]
pub struct FakeFetcher {
    images: Arc<Mutex<HashMap<String, MemoryImage>>>,
    calls: Arc<Mutex<Vec<(String, bool, bool)>>>,
}

impl FakeFetcher {
    pub fn with_image(self, name: &str, image: MemoryImage) -> Self {
        self.images.lock().unwrap().insert(normalize(name), image);
        self
    }

    /// (name, daemon, pull) の一覧
    pub fn calls(&self) -> Vec<(String, bool, bool)> {
        self.calls.lock().unwrap().clone()
    }
}

impl ImageFetcher for FakeFetcher {
    type Image = MemoryImage;

    async fn fetch(&self, name: &str, daemon: bool, pull: bool) -> BuildResult<MemoryImage> {
        self.calls
            .lock()
            .unwrap()
            .push((name.to_string(), daemon, pull));
        self.images
            .lock()
            .unwrap()
            .get(&normalize(name))
            .cloned()
            .ok_or_else(|| BuildError::ImageNotFound {
                image: name.to_string(),
                location: "in fake fetcher".to_string(),
            })
    }
}

fn normalize(name: &str) -> String {
    ImageRef::parse(name)
        .map(|r| r.name())
        .unwrap_or_else(|_| name.to_string())
}

/// ライフサイクルに渡された内容
#[derive(Debug, Clone)]
pub struct Execution {
    pub app_dir: PathBuf,
    pub image: String,
    pub run_image: String,
    pub builder: String,
    pub order: Vec<GroupMetadata>,
    pub clear_cache: bool,
    pub publish: bool,
}

/// 実行内容を記録するだけの LifecycleExecutor
#[derive(Clone, Default)]
pub struct FakeLifecycle {
    executions: Arc<Mutex<Vec<Execution>>>,
}

impl FakeLifecycle {
    pub fn executions(&self) -> Vec<Execution> {
        self.executions.lock().unwrap().clone()
    }
}

impl LifecycleExecutor for FakeLifecycle {
    async fn execute<I: Image>(
        &self,
        _token: &CancellationToken,
        options: LifecycleOptions<I>,
    ) -> cnbpack_container::Result<()> {
        self.executions.lock().unwrap().push(Execution {
            app_dir: options.app_dir,
            image: options.image.name(),
            run_image: options.run_image.name(),
            builder: options.builder.name(),
            order: options.builder.order().to_vec(),
            clear_cache: options.clear_cache,
            publish: options.publish,
        });
        Ok(())
    }
}

pub type TestClient = Client<FakeFetcher, FakeLifecycle, MemoryRuntime>;

pub fn client(config: Config, fetcher: FakeFetcher, lifecycle: FakeLifecycle) -> TestClient {
    client_with_runtime(config, fetcher, lifecycle, MemoryRuntime::new())
}

pub fn client_with_runtime(
    config: Config,
    fetcher: FakeFetcher,
    lifecycle: FakeLifecycle,
    runtime: MemoryRuntime,
) -> TestClient {
    Client::new(config, fetcher, lifecycle, runtime)
        .with_names(Arc::new(NameGenerator::seeded(1)))
}

/// ランイメージとミラーを宣言したビルダーイメージ
pub fn builder_image(run_image: &str, mirrors: &[&str]) -> MemoryImage {
    let metadata = BuilderMetadata {
        buildpacks: vec![BuildpackMetadata {
            id: "some/bp".to_string(),
            version: "1.2.3".to_string(),
            latest: true,
        }],
        groups: vec![GroupMetadata {
            buildpacks: vec![GroupBuildpack::new("some/bp", "1.2.3")],
        }],
        stack: StackMetadata {
            run_image: RunImageMetadata {
                image: run_image.to_string(),
                mirrors: mirrors.iter().map(|m| m.to_string()).collect(),
            },
        },
    };

    MemoryImage::new("some/builder")
        .with_env(ENV_UID, "1234")
        .with_env(ENV_GID, "4321")
        .with_label(STACK_ID_LABEL, STACK_ID)
        .with_label(METADATA_LABEL, &metadata.encode().unwrap())
}

pub fn run_image(name: &str, stack_id: &str) -> MemoryImage {
    MemoryImage::new(name).with_label(STACK_ID_LABEL, stack_id)
}

/// デフォルトビルダーを設定した Config
pub fn config_with_default_builder(builder: &str) -> Config {
    let mut config = Config::default();
    config.set_default_builder(builder);
    config
}
