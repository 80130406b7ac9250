use anyhow::Result;

use super::CliOptions;
use crate::core::exec::CommandTarget;
use crate::core::terminal::{GuideSection, print_success};

fn describe(target: &CommandTarget) -> String {
    match target {
        CommandTarget::Remote(t) => format!(
            "{} as {} ({} command(s))",
            t.address(),
            t.credentials.user,
            t.commands.len()
        ),
        CommandTarget::Local(t) => format!("local ({} command(s))", t.commands.len()),
    }
}

/// Loads and validates the configuration without connecting anywhere.
pub fn run_check(options: CliOptions) -> Result<()> {
    let config = options.load_config()?;
    let targets = config.pipeline_targets();

    let mut section = GuideSection::new("Configuration")
        .status("Config file", &options.config.display().to_string())
        .status(
            "Server",
            &format!(
                "{}:{}",
                options.host.as_deref().unwrap_or(&config.file.server.host),
                options.port.unwrap_or(config.file.server.port)
            ),
        )
        .blank()
        .status("scheduler", &describe(&targets.scheduler))
        .status("sdvn", &describe(&targets.analysis))
        .status("slab", &describe(&targets.local));
    if let Some(background) = &targets.log.background_cmd {
        section = section.blank().text(&format!(
            "Log tail on {}: {}",
            targets.log.label, background
        ));
    }
    section.print();
    println!();

    print_success("Configuration is valid");
    Ok(())
}
