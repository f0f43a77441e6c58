//! Operator CLI: push block rules into a Web ACL and smoke-test the WAF.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use waf_auto_block::model::{BlockAddress, Scope};
use waf_auto_block::push::unix_timestamp;
use waf_auto_block::smoke::SmokeTester;
use waf_auto_block::waf::AwsWaf;
use waf_auto_block::{BlockPusher, Config};

#[derive(Parser, Debug)]
#[command(name = "waf-block")]
#[command(about = "Push block rules to AWS WAFv2 and verify the WAF is enforcing them")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: String,

    /// Print example configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Insert a block rule for an IP/CIDR and/or a URI pattern at the top of a Web ACL
    Push {
        /// Name of the Web ACL to update
        #[arg(long)]
        web_acl_name: String,

        /// Scope of the Web ACL (REGIONAL or CLOUDFRONT)
        #[arg(long)]
        scope: Scope,

        /// IP address or CIDR to block
        #[arg(long, required_unless_present = "uri")]
        ip: Option<String>,

        /// URI string or regex pattern to block
        #[arg(long)]
        uri: Option<String>,
    },

    /// Send one benign and one malicious request and check the WAF's answers
    Smoke {
        /// Base URL of the protected application
        base_url: String,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --print-config
    if args.print_config {
        println!("{}", Config::example());
        return Ok(());
    }

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Load configuration
    let config = match &args.config {
        Some(path) => {
            info!(config = %path.display(), "Loading configuration");
            Config::load(path)
                .with_context(|| format!("Failed to load configuration from {}", path.display()))?
        }
        None => Config::default(),
    };

    // Handle --validate
    if args.validate {
        info!("Configuration is valid");
        return Ok(());
    }

    match args.command {
        Some(Command::Push {
            web_acl_name,
            scope,
            ip,
            uri,
        }) => push(&config, &web_acl_name, scope, ip.as_deref(), uri.as_deref()).await,
        Some(Command::Smoke { base_url }) => smoke(&config, &base_url).await,
        None => anyhow::bail!("No command given; see --help"),
    }
}

async fn push(
    config: &Config,
    web_acl_name: &str,
    scope: Scope,
    ip: Option<&str>,
    uri: Option<&str>,
) -> Result<()> {
    // Validate inputs before touching AWS
    let address = ip.map(BlockAddress::parse).transpose()?;

    let waf = AwsWaf::connect(Some(&config.aws.region)).await;
    let pusher = BlockPusher::new(&waf, &config.rules);
    let web_acl = pusher.resolve_web_acl(web_acl_name, scope).await?;

    if let Some(address) = address {
        let report = pusher.push_ip(&web_acl, &address, unix_timestamp()).await?;
        info!(
            rule = %report.rule_name,
            ip_set = %report.set_arn,
            "IP block pushed to {}",
            web_acl_name
        );
    }

    if let Some(pattern) = uri {
        let report = pusher.push_uri(&web_acl, pattern, unix_timestamp()).await?;
        info!(
            rule = %report.rule_name,
            regex_set = %report.set_arn,
            "URI block pushed to {}",
            web_acl_name
        );
    }

    Ok(())
}

async fn smoke(config: &Config, base_url: &str) -> Result<()> {
    let tester = SmokeTester::new(config.smoke.clone())?;
    let report = tester.run(base_url).await;

    for check in &report.checks {
        println!("{}", check);
    }

    if !report.all_passed() {
        anyhow::bail!("{} of {} smoke checks failed", report.failures(), report.checks.len());
    }

    info!("All smoke checks passed");
    Ok(())
}
