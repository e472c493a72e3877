use cnbpack_config::Config;
use colored::Colorize;
use std::path::Path;

pub fn handle(
    mut config: Config,
    config_path: &Path,
    run_image: &str,
    mirrors: Vec<String>,
) -> anyhow::Result<()> {
    config.set_run_image_mirrors(run_image, mirrors.clone());
    config.write(config_path)?;

    println!(
        "{}",
        format!("✓ Run Image '{}' configured with mirrors:", run_image)
            .green()
            .bold()
    );
    for mirror in &mirrors {
        println!("  • {}", mirror.cyan());
    }
    Ok(())
}
