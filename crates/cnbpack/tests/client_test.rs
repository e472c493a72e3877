mod common;

use cnbpack::{RunOptions, run_image_name};
use cnbpack_builder::GroupBuildpack;
use cnbpack_config::Config;
use cnbpack_container::{MemoryRuntime, SharedBuffer};
use common::*;
use std::io::Write;
use tokio_util::sync::CancellationToken;

const BUILDER: &str = "some/builder";

#[tokio::test]
async fn test_inspect_builder() {
    let fetcher = FakeFetcher::default().with_image(
        BUILDER,
        builder_image("default/run", &["registry1.example.com/run/mirror"]),
    );
    let mut config = Config::default();
    config.set_run_image_mirrors("default/run", vec!["local/mirror".to_string()]);
    let subject = client(config, fetcher.clone(), FakeLifecycle::default());

    let info = subject.inspect_builder(BUILDER, true).await.unwrap().unwrap();
    assert_eq!(info.stack_id, STACK_ID);
    assert_eq!(info.run_image, "default/run");
    assert_eq!(info.local_run_image_mirrors, vec!["local/mirror"]);
    assert_eq!(
        info.run_image_mirrors,
        vec!["registry1.example.com/run/mirror"]
    );
    assert_eq!(info.buildpacks.len(), 1);
    assert!(info.buildpacks[0].latest);
    assert_eq!(
        info.groups[0].buildpacks,
        vec![GroupBuildpack::new("some/bp", "1.2.3")]
    );

    // 存在しないイメージはエラーではなく None
    assert!(
        subject
            .inspect_builder("missing/builder", false)
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(
        fetcher.calls(),
        vec![
            (BUILDER.to_string(), true, false),
            ("missing/builder".to_string(), false, false),
        ]
    );
}

/// ローカルになければレジストリを確認する
#[tokio::test]
async fn test_builder_exists() {
    let fetcher = FakeFetcher::default().with_image(BUILDER, builder_image("default/run", &[]));
    let subject = client(Config::default(), fetcher.clone(), FakeLifecycle::default());

    assert!(subject.builder_exists(BUILDER).await.unwrap());
    assert!(!subject.builder_exists("missing/builder").await.unwrap());
    assert_eq!(
        fetcher.calls(),
        vec![
            (BUILDER.to_string(), true, false),
            ("missing/builder".to_string(), true, false),
            ("missing/builder".to_string(), false, false),
        ]
    );
}

/// アプリディレクトリから決まるイメージをビルドして実行する
#[tokio::test]
async fn test_run_builds_and_runs_app() {
    let app = tempfile::tempdir().unwrap();
    let fetcher = FakeFetcher::default()
        .with_image(BUILDER, builder_image("default/run", &[]))
        .with_image("default/run", run_image("default/run", STACK_ID));
    let lifecycle = FakeLifecycle::default();
    let runtime = MemoryRuntime::with_handler(|spec, _, out| {
        writeln!(out, "serving {}", spec.image).unwrap();
        0
    });
    let subject = client_with_runtime(
        config_with_default_builder(BUILDER),
        fetcher,
        lifecycle.clone(),
        runtime.clone(),
    );

    let mut output = SharedBuffer::new();
    subject
        .run(
            &CancellationToken::new(),
            RunOptions {
                app_dir: Some(app.path().to_path_buf()),
                ports: vec!["8080".to_string()],
                ..Default::default()
            },
            &mut output,
        )
        .await
        .unwrap();

    let image = run_image_name(app.path());
    let executions = lifecycle.executions();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].image, format!("{}:latest", image));
    assert!(!executions[0].publish);

    let created = runtime.created();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].image, image);
    assert_eq!(created[0].ports[0].container_port, 8080);
    assert_eq!(runtime.live_containers(), 0);

    let output = output.contents();
    assert!(output.contains("===> RUNNING"));
    assert!(output.contains(&format!("serving {}", image)));
}

/// ビルドに失敗した場合はアプリを起動しない
#[tokio::test]
async fn test_run_stops_on_build_failure() {
    let app = tempfile::tempdir().unwrap();
    let runtime = MemoryRuntime::new();
    let subject = client_with_runtime(
        config_with_default_builder(BUILDER),
        FakeFetcher::default(),
        FakeLifecycle::default(),
        runtime.clone(),
    );

    let mut output = SharedBuffer::new();
    let err = subject
        .run(
            &CancellationToken::new(),
            RunOptions {
                app_dir: Some(app.path().to_path_buf()),
                ..Default::default()
            },
            &mut output,
        )
        .await
        .unwrap_err();

    assert!(err.to_string().contains("build failed"));
    assert!(runtime.created().is_empty());
}
