use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use polaris_client::config::load_config;
use polaris_client::hash::HashRegistry;
use polaris_client::load_balancer::LoadBalanceType;
use polaris_client::model::{Criteria, ServiceKey};
use polaris_client::observability::logging;
use polaris_client::{ConsumerApi, Context, InstanceRequest};

#[derive(Parser)]
#[command(name = "polaris-cli")]
#[command(about = "Inspection CLI for the Polaris client core", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the 64-bit hash of a key
    Hash {
        #[arg(long, default_value = "murmur3")]
        func: String,
        #[arg(long, default_value_t = 0)]
        seed: u32,
        key: String,
    },
    /// Route and balance many keys over a static service and print the shares
    Simulate {
        #[arg(short, long)]
        config: PathBuf,
        /// Service as namespace/name
        #[arg(short, long)]
        service: String,
        #[arg(short, long, default_value_t = 10_000)]
        keys: u64,
        /// Override the configured balancer
        #[arg(long)]
        lb: Option<String>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Hash { func, seed, key } => {
            let hash = HashRegistry::new().get(&func)?;
            println!("{}", hash(key.as_bytes(), seed));
        }
        Commands::Simulate {
            config,
            service,
            keys,
            lb,
        } => {
            let config = load_config(&config)?;
            logging::init_logging(&config.observability.log_level);
            let service_key: ServiceKey = service.parse()?;
            let lb_type = lb.map(|name| name.parse::<LoadBalanceType>()).transpose()?;

            let api = ConsumerApi::new(Context::new(config)?);
            let mut counts: BTreeMap<String, u64> = BTreeMap::new();
            let mut failed = 0u64;
            for index in 0..keys {
                let mut request = InstanceRequest::new(service_key.clone())
                    .with_criteria(Criteria::with_hash_string(format!("key-{}", index)));
                request.load_balance_type = lb_type;
                match api.get_one_instance(&request) {
                    Ok(instance) => *counts.entry(instance.id.clone()).or_default() += 1,
                    Err(e) => {
                        failed += 1;
                        tracing::debug!(error = %e, "Selection failed");
                    }
                }
            }

            let lb_name = lb_type.unwrap_or(api.context().default_lb_type());
            println!("{} over {} keys ({})", service_key, keys, lb_name);
            for (id, count) in &counts {
                println!("  {:<24} {:>8} {:>7.2}%", id, count, *count as f64 * 100.0 / keys.max(1) as f64);
            }
            if failed > 0 {
                println!("  failed                   {:>8}", failed);
            }
        }
    }

    Ok(())
}
