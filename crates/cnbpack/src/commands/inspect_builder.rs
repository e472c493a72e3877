use super::DockerClient;
use cnbpack::BuilderInfo;
use colored::Colorize;

pub async fn handle(client: &DockerClient, builder: Option<String>) -> anyhow::Result<()> {
    let Some(builder) = builder.or_else(|| client.config().default_builder.clone()) else {
        super::suggest_setting_builder();
        return Ok(());
    };

    println!("{}", format!("Inspecting builder: {}", builder).bold());

    for (label, daemon) in [("Remote", false), ("Local", true)] {
        println!();
        println!("{}", label.yellow().bold());
        match client.inspect_builder(&builder, daemon).await {
            Ok(Some(info)) => print_info(&info),
            Ok(None) => println!("  {}", "(not present)".dimmed()),
            Err(e) => println!("  {}", format!("ERROR: {:#}", e).red()),
        }
    }
    Ok(())
}

fn print_info(info: &BuilderInfo) {
    println!("  Stack: {}", info.stack_id.cyan());

    println!("  Run Images:");
    for mirror in &info.local_run_image_mirrors {
        println!("    {} {}", mirror, "(user-configured)".dimmed());
    }
    println!("    {}", info.run_image);
    for mirror in &info.run_image_mirrors {
        println!("    {}", mirror);
    }

    println!("  Buildpacks:");
    if info.buildpacks.is_empty() {
        println!("    {}", "(none)".dimmed());
    }
    for bp in &info.buildpacks {
        let latest = if bp.latest { "(latest)" } else { "" };
        println!("    {:<40} {:<12} {}", bp.id, bp.version, latest.dimmed());
    }

    println!("  Detection Order:");
    if info.groups.is_empty() {
        println!("    {}", "(none)".dimmed());
    }
    for (i, group) in info.groups.iter().enumerate() {
        let buildpacks: Vec<String> = group
            .buildpacks
            .iter()
            .map(|bp| format!("{}@{}", bp.id, bp.version))
            .collect();
        println!("    Group #{}: {}", i + 1, buildpacks.join(", "));
    }
}
