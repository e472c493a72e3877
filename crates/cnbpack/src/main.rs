mod commands;
mod docker;

use clap::{Args, Parser, Subcommand};
use cnbpack::{BuildOptions, RunOptions, parse_env};
use cnbpack_config::Config;
use colored::Colorize;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pack")]
#[command(about = "ソースコードからアプリケーションイメージをビルド", long_about = None)]
struct Cli {
    /// 詳細なログを出力
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// build / run 共通のオプション
#[derive(Args)]
struct BuildArgs {
    /// アプリケーションディレクトリ（デフォルト: カレントディレクトリ）
    #[arg(short = 'p', long = "path")]
    path: Option<PathBuf>,
    /// ビルダーイメージ（デフォルト: set-default-builder で設定したもの）
    #[arg(long)]
    builder: Option<String>,
    /// ランイメージ（デフォルト: ビルダーのランイメージ）
    #[arg(long = "run-image")]
    run_image: Option<String>,
    /// ビルド時環境変数 (KEY=VALUE または KEY)
    #[arg(short = 'e', long = "env")]
    env: Vec<String>,
    /// ビルド時環境変数のファイル（1行1変数）
    #[arg(long = "env-file")]
    env_file: Option<PathBuf>,
    /// イメージを pull しない
    #[arg(long = "no-pull")]
    no_pull: bool,
    /// キャッシュを使わずにビルド
    #[arg(long = "clear-cache")]
    clear_cache: bool,
    /// 使用する buildpack（id、id@version、またはディレクトリ）
    ///
    /// 指定した順に実行される。カンマ区切りでも指定可能
    #[arg(long = "buildpack", value_delimiter = ',')]
    buildpacks: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// アプリケーションイメージをビルド
    Build {
        /// 出力するイメージ名
        image: String,
        #[command(flatten)]
        args: BuildArgs,
        /// ビルドしたイメージをレジストリに直接 publish する
        #[arg(long)]
        publish: bool,
    },
    /// アプリケーションをビルドしてコンテナで実行
    Run {
        #[command(flatten)]
        args: BuildArgs,
        /// 公開するポート ([ip:]host:container[/protocol])
        ///
        /// 指定しない場合はイメージの公開ポートを使用
        #[arg(long = "port", value_delimiter = ',')]
        ports: Vec<String>,
    },
    /// デフォルトのビルダーを設定
    SetDefaultBuilder {
        /// ビルダーイメージ
        builder: Option<String>,
    },
    /// ビルダーの情報を表示
    InspectBuilder {
        /// ビルダーイメージ（デフォルト: 設定済みのビルダー）
        builder: Option<String>,
    },
    /// ランイメージのミラーを設定
    SetRunImageMirrors {
        /// ランイメージ
        run_image: String,
        /// ミラー（複数指定可能）
        #[arg(short = 'm', long = "mirror", required = true)]
        mirrors: Vec<String>,
    },
    /// バージョン情報を表示
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    // Versionコマンドは設定ファイル不要
    if matches!(cli.command, Commands::Version) {
        println!("pack {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config_path = cnbpack_config::default_config_path()?;
    let config = Config::load(&config_path)?;
    tracing::debug!("Loaded config from {}", config_path.display());

    // set-run-image-mirrors は Docker 不要
    if let Commands::SetRunImageMirrors { run_image, mirrors } = cli.command {
        return commands::set_run_image_mirrors::handle(config, &config_path, &run_image, mirrors);
    }

    let token = cancel_on_ctrl_c();
    let client = commands::docker_client(config).await?;

    match cli.command {
        Commands::Build {
            image,
            args,
            publish,
        } => {
            let opts = BuildOptions {
                image,
                app_dir: args.path,
                builder: args.builder,
                run_image: args.run_image,
                env: parse_env(args.env_file.as_deref(), &args.env)?,
                publish,
                no_pull: args.no_pull,
                clear_cache: args.clear_cache,
                buildpacks: args.buildpacks,
            };
            commands::build::handle(&client, &token, opts).await?;
        }
        Commands::Run { args, ports } => {
            let opts = RunOptions {
                app_dir: args.path,
                builder: args.builder,
                run_image: args.run_image,
                env: parse_env(args.env_file.as_deref(), &args.env)?,
                no_pull: args.no_pull,
                clear_cache: args.clear_cache,
                buildpacks: args.buildpacks,
                ports,
            };
            commands::run::handle(&client, &token, opts).await?;
        }
        Commands::SetDefaultBuilder { builder } => {
            commands::set_default_builder::handle(&client, &config_path, builder).await?;
        }
        Commands::InspectBuilder { builder } => {
            commands::inspect_builder::handle(&client, builder).await?;
        }
        Commands::SetRunImageMirrors { .. } => {
            unreachable!("SetRunImageMirrors is handled before connecting to Docker");
        }
        Commands::Version => {
            unreachable!("Version is handled before config loading");
        }
    }

    Ok(())
}

/// Ctrl-C でキャンセルされるトークン
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!();
            eprintln!("{}", "中断しています...".yellow());
            canceller.cancel();
        }
    });
    token
}
