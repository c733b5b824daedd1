use std::path::PathBuf;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ipamd::service::ServiceResult;
use ipamd::spec::read_spec;
use ipamd::{Code, Config, DhcpServer, Error, Ipam, IpamService, LeaseManager, Result, Status, Store};

#[derive(Parser)]
#[command(name = "ipamd")]
#[command(author, version, about = "IP address management with a DHCP front end", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "ipamd.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the lease sweep and the DHCP server until interrupted.
    Run,
    ShowConfig,
    /// Add the networks and member lists in a YAML spec file.
    Apply { file: PathBuf },
    Networks,
    Network { name: String },
    DeleteNetwork { name: String },
    Members { network: String },
    DeleteMembers {
        #[arg(required = true)]
        macs: Vec<String>,
    },
    Resolve { name: String },
    /// Recycle expired leases once and exit.
    Sweep,
}

fn print_json<T: serde::Serialize>(value: &T) -> ServiceResult<()> {
    let text = serde_json::to_string_pretty(value).map_err(Error::from)?;
    println!("{}", text);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Config::load_or_create(&cli.config)?;
    let command = cli.command.unwrap_or(Commands::Run);

    if let Commands::ShowConfig = command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let ipam = Ipam::new(Store::connect(&config.store).await?, &config);

    if let Commands::Run = command {
        info!(config = ?cli.config, "starting ipamd");
        let sweeper = LeaseManager::new(ipam.clone(), config.sweep_interval()).spawn();
        let server = DhcpServer::new(ipam, &config.dhcpd)?;

        let result = tokio::select! {
            result = server.run() => result,
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal, stopping");
                Ok(())
            }
        };
        sweeper.shutdown().await;
        if let Err(error) = &result {
            error!(error = %error, "DHCP server failed");
        }
        return result;
    }

    if let Err(status) = admin(&IpamService::new(ipam), command).await {
        eprintln!("error: {}", status);
        std::process::exit(1);
    }
    Ok(())
}

async fn admin(service: &IpamService, command: Commands) -> ServiceResult<()> {
    match command {
        Commands::Run | Commands::ShowConfig => Ok(()),
        Commands::Apply { file } => {
            let objects = read_spec(&file).map_err(Status::from)?;
            let count = objects.len();
            service.apply_spec(objects).await?;
            println!("Applied {} document(s) from {}.", count, file.display());
            Ok(())
        }
        Commands::Networks => {
            let networks = service.get_networks().await?;
            if networks.is_empty() {
                println!("No networks.");
                return Ok(());
            }
            println!("{:<16} {:<20} {:<34} {:<20}", "Name", "Subnet", "Pool", "Domain");
            println!("{}", "-".repeat(90));
            for network in networks {
                let subnet = network
                    .subnet4
                    .map(|subnet| subnet.to_string())
                    .unwrap_or_default();
                let pool = network
                    .range4
                    .map(|range| format!("{} - {}", range.begin, range.end))
                    .unwrap_or_else(|| "static".to_string());
                println!(
                    "{:<16} {:<20} {:<34} {:<20}",
                    network.name, subnet, pool, network.domain
                );
            }
            Ok(())
        }
        Commands::Network { name } => print_json(&service.get_network(&name).await?),
        Commands::DeleteNetwork { name } => {
            service.delete_network(&name).await?;
            println!("Deleted network {}.", name);
            Ok(())
        }
        Commands::Members { network } => {
            let members = service.get_members(&network).await?;
            if members.is_empty() {
                println!("No members.");
                return Ok(());
            }
            println!("{:<20} {:<16} {:<24} {:<28}", "MAC", "IPv4", "Expires At", "Name");
            println!("{}", "-".repeat(90));
            let now = Utc::now();
            for member in members {
                let (address, expires) = match &member.ip4 {
                    Some(lease) => (
                        lease.address.to_string(),
                        match lease.expires {
                            Some(_) if lease.is_expired_at(now) => "expired".to_string(),
                            Some(at) => at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
                            None => "static".to_string(),
                        },
                    ),
                    None => (String::new(), String::new()),
                };
                println!(
                    "{:<20} {:<16} {:<24} {:<28}",
                    member.mac, address, expires, member.name
                );
            }
            Ok(())
        }
        Commands::DeleteMembers { macs } => {
            service.delete_members(&macs).await?;
            println!("Deleted {} member(s).", macs.len());
            Ok(())
        }
        Commands::Resolve { name } => {
            match service.resolve(&name).await {
                Ok(addrs) => {
                    if let Some(ip4) = addrs.ip4 {
                        println!("{}\tA\t{}", name, ip4);
                    }
                    if let Some(ip6) = addrs.ip6 {
                        println!("{}\tAAAA\t{}", name, ip6);
                    }
                }
                Err(status) if status.code == Code::NotFound => println!("{} not found.", name),
                Err(status) => return Err(status),
            }
            Ok(())
        }
        Commands::Sweep => {
            let count = service.sweep().await?;
            println!("Recycled {} expired lease(s).", count);
            Ok(())
        }
    }
}
