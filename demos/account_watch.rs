/// Account watch: authenticates, prints current positions and open
/// orders, then streams account events (order state, trades, deposits).
///
/// Usage: cargo run --example account_watch <username> <password> <account_id> [totp_secret]
use futures_util::StreamExt;
use ndax_sdk::{Credentials, NdaxClient, SessionConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let (Some(username), Some(password), Some(account_id)) =
        (args.next(), args.next(), args.next())
    else {
        eprintln!("usage: account_watch <username> <password> <account_id> [totp_secret]");
        std::process::exit(2);
    };

    let mut credentials = Credentials::new(username, password);
    if let Some(secret) = args.next() {
        credentials = credentials.with_totp_secret(secret);
    }
    let config = SessionConfig::default()
        .with_credentials(credentials)
        .with_account_id(account_id.parse()?);

    let mut client = NdaxClient::new(config);
    client.start()?;
    client.authenticate().await?;
    println!("authenticated");

    let positions = client.get_account_positions().await?;
    println!("positions: {positions}");
    let open_orders = client.get_open_orders().await?;
    println!("open orders: {open_orders}");

    let mut events = client.subscribe_account_events().await?;
    while let Some(event) = events.next().await {
        println!("event: {event}");
    }

    client.stop().await;
    Ok(())
}
