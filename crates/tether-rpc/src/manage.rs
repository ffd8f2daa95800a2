//! Directory management commands.

use anyhow::{anyhow, bail, Result};
use clap::Args;
use tether_core::{CapabilityFilter, ComponentName, SqliteDirectory, TetherError};
use tracing::info;

#[derive(Args, Debug)]
pub struct InstallArgs {
    /// Provider component as `package/class` (`.Class` is relative to the package)
    component: String,

    /// Action the provider serves (repeatable)
    #[arg(long = "action", required = true)]
    actions: Vec<String>,

    /// Category the provider declares (repeatable)
    #[arg(long = "category")]
    categories: Vec<String>,

    /// Data scheme the provider accepts (repeatable)
    #[arg(long = "scheme")]
    schemes: Vec<String>,

    /// Scheme-specific part the provider accepts; a trailing `*` matches by prefix
    #[arg(long = "ssp")]
    ssps: Vec<String>,
}

impl InstallArgs {
    fn filter(&self) -> CapabilityFilter {
        let mut filter = CapabilityFilter::new();
        filter.actions.extend(self.actions.iter().cloned());
        filter.categories.extend(self.categories.iter().cloned());
        filter.data_schemes.extend(self.schemes.iter().cloned());
        filter.data_ssps.extend(self.ssps.iter().cloned());
        filter
    }
}

#[derive(Args, Debug)]
pub struct RemoveArgs {
    /// Provider component as `package/class`
    #[arg(conflicts_with = "package")]
    component: Option<String>,

    /// Remove every provider of this package
    #[arg(long)]
    package: Option<String>,
}

fn parse_component(text: &str) -> Result<ComponentName> {
    ComponentName::parse(text).ok_or_else(|| anyhow!("Invalid component '{}', expected package/class", text))
}

pub fn install(directory: &SqliteDirectory, args: &InstallArgs) -> Result<()> {
    let component = parse_component(&args.component)?;
    let provider = directory.install(&component, &args.filter())?;
    println!("{}", serde_json::to_string_pretty(&provider)?);
    Ok(())
}

pub fn remove(directory: &SqliteDirectory, args: &RemoveArgs) -> Result<()> {
    match (&args.component, &args.package) {
        (Some(component), None) => {
            let component = parse_component(component)?;
            if !directory.remove_provider(&component)? {
                return Err(TetherError::ProviderNotFound {
                    component: component.to_string(),
                }
                .into());
            }
            info!("Removed {}", component);
        }
        (None, Some(package)) => {
            let removed = directory.remove_package(package)?;
            info!("Removed {} providers of {}", removed, package);
        }
        _ => bail!("Specify a component or --package"),
    }
    Ok(())
}

pub fn list(directory: &SqliteDirectory) -> Result<()> {
    let providers = directory.list()?;
    println!("{}", serde_json::to_string_pretty(&providers)?);
    Ok(())
}
