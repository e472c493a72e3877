use super::DockerClient;
use cnbpack::BuildOptions;
use colored::Colorize;
use tokio_util::sync::CancellationToken;

pub async fn handle(
    client: &DockerClient,
    token: &CancellationToken,
    opts: BuildOptions,
) -> anyhow::Result<()> {
    if opts.builder.is_none() && client.config().default_builder.is_none() {
        super::suggest_setting_builder();
        return Ok(());
    }

    let image = opts.image.clone();
    client.build(token, opts).await?;

    println!();
    println!(
        "{}",
        format!("✓ Successfully built image {}", image).green().bold()
    );
    Ok(())
}
