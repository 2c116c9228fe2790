//! Configuration management commands.

use steady_core::config::IssueSeverity;
use steady_core::Config;

use crate::ConfigAction;

pub fn handle(action: ConfigAction, config: &Config) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            println!("# Config directory: {}", Config::config_dir().display());
            print!("{}", config.to_toml()?);
        }
        ConfigAction::Validate => {
            let result = config.validate();
            if result.issues.is_empty() {
                println!("Configuration is valid.");
                return Ok(());
            }

            for issue in &result.issues {
                let level = match issue.severity {
                    IssueSeverity::Error => "error",
                    IssueSeverity::Warning => "warning",
                };
                println!("{}: {}: {}", level, issue.field, issue.message);
            }
            if !result.is_ok() {
                anyhow::bail!("{} configuration error(s)", result.errors().len());
            }
        }
    }
    Ok(())
}
