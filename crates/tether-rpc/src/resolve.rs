//! `resolve`: run an intent resolver against the directory.

use anyhow::{anyhow, Result};
use clap::Args;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tether_core::{
    IntentResolverProvider, Resolution, ResolutionResult, ResolverArgs, ResolverListener, ResolverRegistry,
    SqliteDirectory, Status, SyncContext,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Args, Debug)]
pub struct ResolveArgs {
    /// Target, e.g. `intent:#Intent;action=com.example.ECHO;end`
    target: String,

    /// Keep running and print a new result on every directory change
    #[arg(long)]
    watch: bool,

    /// Seconds to wait for the first result
    #[arg(long, default_value = "5")]
    timeout: u64,

    /// User whose directory view to resolve in
    #[arg(long)]
    target_user: Option<String>,

    /// Security policy name recorded for the channel
    #[arg(long)]
    security_policy: Option<String>,
}

/// Forwards publications to the command's main task.
struct ChannelListener {
    tx: mpsc::UnboundedSender<Resolution>,
}

impl ResolverListener for ChannelListener {
    fn on_result(&self, result: ResolutionResult) {
        let _ = self.tx.send(Resolution::Success(result));
    }

    fn on_error(&self, status: Status) {
        let _ = self.tx.send(Resolution::Failure(status));
    }
}

fn print_resolution(resolution: &Resolution) -> Result<()> {
    let value = match resolution {
        Resolution::Success(result) => json!({ "success": true, "result": result }),
        Resolution::Failure(status) => json!({ "success": false, "status": status }),
    };
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

pub async fn run(directory: SqliteDirectory, args: &ResolveArgs) -> Result<()> {
    let directory = Arc::new(directory);
    let registry = ResolverRegistry::new().with(Arc::new(IntentResolverProvider::for_directory(directory)));

    let mut resolver_args = ResolverArgs::new(SyncContext::new(), tokio::runtime::Handle::current());
    if let Some(user) = &args.target_user {
        resolver_args = resolver_args.with_target_user(user.clone());
    }
    if let Some(policy) = &args.security_policy {
        resolver_args = resolver_args.with_security_policy(policy.clone());
    }

    let resolver = registry
        .new_resolver(&args.target, &resolver_args)
        .ok_or_else(|| anyhow!("No resolver available for target {}", args.target))?;
    info!("Resolving {} (authority {})", args.target, resolver.service_authority());

    let (tx, mut rx) = mpsc::unbounded_channel();
    resolver.start(Arc::new(ChannelListener { tx }))?;

    let first = tokio::time::timeout(Duration::from_secs(args.timeout), rx.recv()).await;
    let outcome = match first {
        Ok(Some(resolution)) => print_resolution(&resolution),
        Ok(None) => Err(anyhow!("Resolver stopped without a result")),
        Err(_) => Err(anyhow!("No result within {}s", args.timeout)),
    };

    if args.watch && outcome.is_ok() {
        info!("Watching for directory changes, Ctrl+C to stop");
        loop {
            tokio::select! {
                next = rx.recv() => match next {
                    Some(resolution) => print_resolution(&resolution)?,
                    None => break,
                },
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        warn!("Failed to wait for Ctrl+C: {}", e);
                    }
                    break;
                }
            }
        }
    }

    resolver.shutdown();
    outcome
}
