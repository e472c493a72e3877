use super::DockerClient;
use cnbpack::RunOptions;
use colored::Colorize;
use tokio_util::sync::CancellationToken;

pub async fn handle(
    client: &DockerClient,
    token: &CancellationToken,
    opts: RunOptions,
) -> anyhow::Result<()> {
    if opts.builder.is_none() && client.config().default_builder.is_none() {
        super::suggest_setting_builder();
        return Ok(());
    }

    let mut stdout = std::io::stdout();
    client.run(token, opts, &mut stdout).await?;

    if token.is_cancelled() {
        println!();
        println!("{}", "ℹ 中断しました".dimmed());
    }
    Ok(())
}
