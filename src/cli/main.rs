use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::net::Ipv4Addr;

use galaxy::ipam::schema::SchemaManager;
use galaxy::ipam::{
    AllocationRequest, ConnectionManager, FloatingIp, FloatingIpAllocator, IpPoolStore,
};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Floating IP pool administration", long_about = None)]
#[clap(propagate_version = true)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    #[clap(
        short,
        long,
        value_parser,
        default_value = "/var/lib/cni/galaxy/galaxy.db",
        help = "Path to the IP pool database"
    )]
    database: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Seed the pool with every usable address in a subnet
    Seed {
        #[clap(help = "Subnet in CIDR notation, e.g. 10.0.0.0/24")]
        subnet: String,

        #[clap(long, help = "Also reserve the first usable address as gateway")]
        reserve_gateway: bool,
    },

    /// List pool rows, optionally only those owned by a key
    List {
        #[clap(long, help = "Only rows owned by this key")]
        key: Option<String>,
    },

    /// Find rows whose key contains a substring (wildcards are literal)
    Search {
        keyword: String,
    },

    /// Bind an address to a key
    Allocate {
        #[clap(long, help = "Owner key, e.g. <namespace>_<podname>")]
        key: String,

        #[clap(long, help = "Restrict allocation to one subnet")]
        subnet: Option<String>,

        #[clap(long, help = "Claim this specific address instead of the lowest free one")]
        ip: Option<Ipv4Addr>,

        #[clap(long, default_value = "0", help = "Release policy stored on the row")]
        policy: u16,

        #[clap(long, default_value = "", help = "Opaque attr payload")]
        attr: String,
    },

    /// Release one address held by a key
    Release {
        #[clap(long)]
        key: String,

        #[clap(long)]
        ip: Ipv4Addr,
    },

    /// Release every address whose key starts with a prefix
    ReleasePrefix {
        #[clap(help = "Key prefix, e.g. <namespace>_")]
        prefix: String,
    },

    /// Move the newest binding in a subnet from one key to another
    Rebind {
        old_key: String,
        new_key: String,
        subnet: String,
    },

    /// Rename every binding from one key to another
    Rename {
        old_key: String,
        new_key: String,
    },

    /// Show the subnets in which a key holds addresses
    Subnets {
        key: String,
    },

    /// Remove rows from the pool entirely
    Delete {
        #[clap(required = true, num_args = 1..)]
        ips: Vec<Ipv4Addr>,
    },
}

fn print_rows(rows: &[FloatingIp]) {
    if rows.is_empty() {
        println!("(no rows)");
        return;
    }
    println!(
        "{:<16} {:<18} {:<28} {:>6}  {}",
        "IP", "SUBNET", "KEY", "POLICY", "ATTR"
    );
    for row in rows {
        println!(
            "{:<16} {:<18} {:<28} {:>6}  {}",
            row.ip.to_string(),
            row.subnet,
            if row.key.is_empty() { "-" } else { &row.key },
            row.policy,
            row.attr
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let conn = ConnectionManager::new(&cli.database).await.map_err(|e| {
        eprintln!("❌ Failed to open pool database at {}: {}", cli.database, e);
        e
    })?;
    SchemaManager::new(conn.pool().clone())
        .initialize_schema()
        .await?;
    let allocator = FloatingIpAllocator::new(IpPoolStore::new(conn.pool().clone()));

    match cli.command {
        Commands::Seed {
            subnet,
            reserve_gateway,
        } => {
            let created = allocator.seed_subnet(&subnet, reserve_gateway).await?;
            println!("✅ Seeded {} addresses from {}", created, subnet);
        }

        Commands::List { key } => {
            let rows = match key {
                Some(key) => allocator.ips_for_key(&key).await?,
                None => allocator.store().find_all().await?,
            };
            print_rows(&rows);
        }

        Commands::Search { keyword } => {
            let rows = allocator.search(&keyword).await?;
            print_rows(&rows);
        }

        Commands::Allocate {
            key,
            subnet,
            ip,
            policy,
            attr,
        } => {
            if let Some(ip) = ip {
                allocator
                    .allocate_specific(ip, &key, policy, &attr)
                    .await
                    .map_err(|e| {
                        eprintln!("❌ {} is not free: {}", ip, e);
                        e
                    })?;
                println!("✅ {} -> {}", key, ip);
            } else {
                let allocation = allocator
                    .allocate(&AllocationRequest {
                        key: key.clone(),
                        subnet,
                        policy,
                        attr,
                    })
                    .await
                    .map_err(|e| {
                        eprintln!("❌ Allocation for {} failed: {}", key, e);
                        e
                    })?;
                println!("✅ {} -> {} ({})", key, allocation.ip, allocation.subnet);
            }
        }

        Commands::Release { key, ip } => {
            allocator.release(&key, ip).await.map_err(|e| {
                eprintln!("❌ Release of {} failed: {}", ip, e);
                e
            })?;
            println!("✅ Released {}", ip);
        }

        Commands::ReleasePrefix { prefix } => {
            let released = allocator.release_prefix(&prefix).await?;
            println!("✅ Released {} addresses with prefix {:?}", released, prefix);
        }

        Commands::Rebind {
            old_key,
            new_key,
            subnet,
        } => {
            allocator
                .rebind_in_subnet(&old_key, &new_key, &subnet, 0, "")
                .await
                .map_err(|e| {
                    eprintln!("❌ Rebind {} -> {} failed: {}", old_key, new_key, e);
                    e
                })?;
            println!("✅ {} inherited the newest {} binding in {}", new_key, old_key, subnet);
        }

        Commands::Rename { old_key, new_key } => {
            let renamed = allocator.rename(&old_key, &new_key, "").await?;
            println!("✅ Renamed {} bindings {} -> {}", renamed, old_key, new_key);
        }

        Commands::Subnets { key } => {
            let subnets = allocator.subnets_for_key(&key).await?;
            if subnets.is_empty() {
                println!("(no bindings for {})", key);
            } else {
                for subnet in subnets {
                    println!("{}", subnet);
                }
            }
        }

        Commands::Delete { ips } => {
            let mut wanted = HashMap::new();
            for ip in &ips {
                wanted.insert(*ip, String::new());
            }
            // Ownership probe only: with empty expected keys, reconcile
            // releases nothing that is held and reports each held row's
            // current owner in `undeleted`. The delete below is what
            // removes rows, owned or not.
            let (_, undeleted) = allocator.reconcile(&wanted).await?;
            for (ip, owner) in &undeleted {
                if !owner.is_empty() {
                    println!("⚠️  {} is held by {}, deleting anyway", ip, owner);
                }
            }
            let deleted = allocator.store().delete_unscoped(&ips).await?;
            println!("✅ Deleted {} rows", deleted);
        }
    }

    Ok(())
}
