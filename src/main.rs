use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::signature::read_keypair_file;
use solana_sdk::signer::Signer;

use chapter_unlock_backend::chain::RpcChainClient;
use chapter_unlock_backend::client;
use chapter_unlock_backend::config::MerchantConfig;
use chapter_unlock_backend::oracle::PriceOracle;
use chapter_unlock_backend::server::{self, AppState};
use chapter_unlock_backend::store::{Chapter, UnlockStore};
use chapter_unlock_backend::verify::{Currency, Verifier};

#[derive(Parser, Debug)]
#[command(name = "chapter-unlock-backend", version, about = "On-chain unlock service for premium manga chapters")]
struct Args {
    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the HTTP unlock service
    Serve,
    /// Insert or update a chapter in the local catalog
    Seed {
        #[arg(long)]
        chapter_id: String,
        #[arg(long)]
        manga_id: String,
        #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
        premium: bool,
        #[arg(long)]
        price_usd: Option<f64>,
    },
    /// Pay for a chapter and claim the unlock against a running service
    Pay {
        #[arg(long)]
        keypair: PathBuf,
        #[arg(long, default_value = "http://127.0.0.1:3000")]
        server: String,
        #[arg(long)]
        manga_id: String,
        #[arg(long)]
        chapter_id: String,
        #[arg(long, default_value = "SOL")]
        currency: String,
        /// Chapter price in USD; in the full platform this comes from the
        /// content API alongside the chapter metadata.
        #[arg(long, default_value_t = 2.5)]
        price_usd: f64,
    },
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    env_logger::init();
    if let Err(err) = run(Args::parse()).await {
        log::error!("{err}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = MerchantConfig::from_env()?;
    match args.command.unwrap_or(Cmd::Serve) {
        Cmd::Serve => {
            let store = UnlockStore::open(&config.db_path)?;
            let chain = Arc::new(RpcChainClient::new(config.rpc_url.clone()));
            let oracle = PriceOracle::new(config.price_api_url.clone());
            let verifier = Verifier::new(&config, chain, oracle, store);
            server::serve(&config.bind, AppState { verifier: Arc::new(verifier) }).await
        }
        Cmd::Seed { chapter_id, manga_id, premium, price_usd } => {
            let store = UnlockStore::open(&config.db_path)?;
            let chapter = Chapter {
                id: chapter_id.clone(),
                manga_id,
                is_premium: premium,
                price_usd: price_usd.and_then(Decimal::from_f64),
            };
            store.put_chapter(&chapter)?;
            log::info!("seeded chapter {chapter_id}");
            Ok(())
        }
        Cmd::Pay { keypair, server, manga_id, chapter_id, currency, price_usd } => {
            let currency = Currency::from_wire(&currency)
                .ok_or_else(|| format!("unsupported currency: {currency}"))?;
            let price_usd =
                Decimal::from_f64(price_usd).ok_or("price-usd is not a valid amount")?;
            let signer = read_keypair_file(&keypair)
                .map_err(|e| format!("failed to read keypair {}: {e}", keypair.display()))?;
            let rpc = RpcClient::new(config.rpc_url.clone());
            let oracle = PriceOracle::new(config.price_api_url.clone());
            log::info!("paying as {} for chapter {chapter_id}", signer.pubkey());
            match client::pay_and_unlock(
                &rpc, &signer, &config, &oracle, &server, &manga_id, &chapter_id, price_usd,
                currency,
            )
            .await
            {
                Ok(ticket) => {
                    println!("{} (tx {})", ticket.message, ticket.signature);
                    Ok(())
                }
                Err(client::ClientError::Rejected { error, signature }) => {
                    // The chapter stays locked; keep the signature visible so
                    // support can trace the payment on an explorer.
                    eprintln!("unlock rejected: {error}");
                    eprintln!("transaction: https://explorer.solana.com/tx/{signature}");
                    Err(error.into())
                }
                Err(err) => Err(err.into()),
            }
        }
    }
}
