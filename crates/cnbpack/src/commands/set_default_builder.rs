use super::DockerClient;
use colored::Colorize;
use std::path::Path;

pub async fn handle(
    client: &DockerClient,
    config_path: &Path,
    builder: Option<String>,
) -> anyhow::Result<()> {
    let Some(builder) = builder else {
        println!("使い方:");
        println!("  {}", "pack set-default-builder <builder image>".cyan());
        println!();
        super::suggest_builders();
        return Ok(());
    };

    if !client.builder_exists(&builder).await? {
        anyhow::bail!("builder {} not found", builder);
    }

    let mut config = client.config().clone();
    config.set_default_builder(&builder);
    config.write(config_path)?;

    println!(
        "{}",
        format!("✓ Builder {} is now the default builder", builder)
            .green()
            .bold()
    );
    Ok(())
}
