use agentmarket::{
    client::AgentClient,
    model::{AgentRole, TransactionStatus},
    offer::OfferDecision,
};
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "buyer-agent")]
#[command(about = "Command-line agent that trades on a marketplace")]
struct Args {
    #[arg(short, long, default_value = "http://localhost:8000", env = "MARKETPLACE_URL")]
    marketplace: String,

    #[arg(long, env = "AGENT_ID")]
    agent_id: Option<Uuid>,

    /// Hex-encoded ed25519 secret key.
    #[arg(long, env = "AGENT_KEY", hide_env_values = true)]
    key: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate an agent id and signing key.
    Keygen,
    Register {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "buyer")]
        role: String,
    },
    Search {
        #[arg(default_value = "")]
        query: String,
        #[arg(long)]
        max_price: Option<Decimal>,
    },
    /// Publish a listing (seller agents).
    Sell {
        title: String,
        price: Decimal,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value = "USDC")]
        asset: String,
    },
    Offer {
        listing_id: Uuid,
        price: Decimal,
    },
    Buy {
        listing_id: Uuid,
        /// Make this offer first and only buy if the seller accepts.
        #[arg(long)]
        offer: Option<Decimal>,
        /// Poll until the transaction settles.
        #[arg(long)]
        wait: bool,
    },
    Status {
        transaction_id: Uuid,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Command::Keygen => keygen(),
        command => {
            let agent_id = args.agent_id.context("--agent-id or AGENT_ID is required")?;
            let key = parse_key(args.key.as_deref().context("--key or AGENT_KEY is required")?)?;
            let client = AgentClient::new(&args.marketplace, agent_id, key)?;
            run(&client, command).await
        }
    }
}

fn keygen() -> anyhow::Result<()> {
    let key = SigningKey::generate(&mut OsRng);
    println!("AGENT_ID={}", Uuid::new_v4());
    println!("AGENT_KEY={}", hex::encode(key.to_bytes()));
    Ok(())
}

async fn run(client: &AgentClient, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Keygen => return keygen(),
        Command::Register { name, role } => {
            let role = AgentRole::from_str(&role.to_uppercase())?;
            let agent = client.register(&name, role, None).await?;
            println!("{}", serde_json::to_string_pretty(&agent)?);
        }
        Command::Search { query, max_price } => {
            let listings = client.search(&query, max_price).await?;
            if listings.is_empty() {
                println!("No listings found");
            }
            for listing in listings {
                println!("{}  {:>12} {:<6} {}", listing.id, listing.price, listing.asset, listing.title);
            }
        }
        Command::Sell { title, price, description, asset } => {
            let listing = client.create_listing(&title, &description, price, &asset).await?;
            println!("Listed {} at {} {}", listing.id, listing.price, listing.asset);
        }
        Command::Offer { listing_id, price } => {
            let response = client.offer(listing_id, price).await?;
            print_offer(response.decision, response.counter_price);
        }
        Command::Buy { listing_id, offer, wait } => {
            if let Some(price) = offer {
                let response = client.offer(listing_id, price).await?;
                print_offer(response.decision, response.counter_price);
                if response.decision != OfferDecision::Accept {
                    bail!("Seller did not accept {}; not buying", price);
                }
            }

            let receipt = client.purchase(listing_id).await?;
            println!("Transaction {} is {}", receipt.transaction_id, receipt.status);
            if let Some(url) = &receipt.explorer_url {
                println!("Explorer: {}", url);
            }

            if wait && receipt.status == TransactionStatus::Pending {
                for _ in 0..30 {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    let transaction = client.get_transaction(receipt.transaction_id).await?;
                    if transaction.status.is_terminal() {
                        println!("Transaction {} is {}", transaction.id, transaction.status);
                        return Ok(());
                    }
                }
                bail!("Transaction {} is still pending", receipt.transaction_id);
            }
        }
        Command::Status { transaction_id } => {
            let transaction = client.get_transaction(transaction_id).await?;
            println!("{}", serde_json::to_string_pretty(&transaction)?);
        }
    }

    Ok(())
}

fn parse_key(hex_key: &str) -> anyhow::Result<SigningKey> {
    let bytes: [u8; 32] = hex::decode(hex_key.trim())
        .context("signing key is not hex")?
        .try_into()
        .map_err(|_| anyhow::anyhow!("signing key must be 32 bytes"))?;
    Ok(SigningKey::from_bytes(&bytes))
}

fn print_offer(decision: OfferDecision, counter_price: Option<Decimal>) {
    match (decision, counter_price) {
        (OfferDecision::Counter, Some(counter)) => println!("COUNTER at {}", counter),
        (decision, _) => println!("{:?}", decision),
    }
}
