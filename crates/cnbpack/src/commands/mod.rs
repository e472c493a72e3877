pub mod build;
pub mod inspect_builder;
pub mod run;
pub mod set_default_builder;
pub mod set_run_image_mirrors;

use crate::docker;
use cnbpack::Client;
use cnbpack_builder::{DockerFetcher, RegistryAuth};
use cnbpack_config::Config;
use cnbpack_container::{DockerRuntime, LifecycleRunner, NameGenerator};
use colored::Colorize;
use std::sync::Arc;

/// Docker デーモンを使うクライアント
pub type DockerClient = Client<DockerFetcher, LifecycleRunner<DockerRuntime>, DockerRuntime>;

/// おすすめのビルダー (提供元, イメージ, 説明)
const SUGGESTED_BUILDERS: &[(&str, &str, &str)] = &[
    (
        "Cloud Foundry",
        "cloudfoundry/cnb:bionic",
        "small base image with Java & Node.js",
    ),
    (
        "Cloud Foundry",
        "cloudfoundry/cnb:cflinuxfs3",
        "larger base image with Java, Node.js & Python",
    ),
    (
        "Heroku",
        "heroku/buildpacks",
        "heroku-18 base image with official Heroku buildpacks",
    ),
];

/// Docker に接続してクライアントを作成
pub async fn docker_client(config: Config) -> anyhow::Result<DockerClient> {
    let docker = docker::init_docker_with_error_handling().await?;
    let auth = RegistryAuth::new();
    let names = Arc::new(NameGenerator::new());
    let runtime = DockerRuntime::new(docker.clone());

    let fetcher = DockerFetcher::new(docker).with_auth(auth.clone());
    let lifecycle = LifecycleRunner::new(runtime.clone())
        .with_auth(auth)
        .with_names(names.clone());
    Ok(Client::new(config, fetcher, lifecycle, runtime).with_names(names))
}

/// デフォルトビルダーの設定方法を表示
pub fn suggest_setting_builder() {
    println!("{}", "デフォルトのビルダーが設定されていません".yellow());
    println!();
    println!("次のコマンドで設定してください:");
    println!("  {}", "pack set-default-builder <builder image>".cyan());
    println!();
    suggest_builders();
}

pub fn suggest_builders() {
    println!("{}", "おすすめのビルダー:".bold());
    let width = SUGGESTED_BUILDERS
        .iter()
        .map(|(_, image, _)| image.len())
        .max()
        .unwrap_or_default();
    for (vendor, image, info) in SUGGESTED_BUILDERS {
        println!(
            "  {:<15} {}  {}",
            format!("{}:", vendor),
            format!("{:<width$}", image, width = width).cyan(),
            info.dimmed()
        );
    }
    println!();
    println!("{}", "ビルダーの詳細は次のコマンドで確認できます:".dimmed());
    println!("  {}", "pack inspect-builder <builder image>".cyan());
}
