/// Ticker tape: streams best bid/offer and public trades for one
/// instrument over an anonymous session.
///
/// Usage: cargo run --example ticker_tape [instrument_id]
use futures_util::StreamExt;
use ndax_sdk::{NdaxClient, SessionConfig, DEFAULT_INCLUDE_LAST_COUNT};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let instrument_id: i64 = std::env::args()
        .nth(1)
        .map(|s| s.parse())
        .transpose()?
        .unwrap_or(1); // 1 = BTC/CAD

    let mut client = NdaxClient::new(SessionConfig::default());
    client.start()?;
    client.authenticate().await?;

    let mut level1 = client.subscribe_level1(instrument_id).await?;
    let mut trades = client
        .subscribe_trades(instrument_id, DEFAULT_INCLUDE_LAST_COUNT)
        .await?;

    loop {
        tokio::select! {
            Some(tick) = level1.next() => {
                println!("L1    {tick}");
            }
            Some(trade) = trades.next() => {
                println!("TRADE {trade}");
            }
            else => break,
        }
    }

    client.stop().await;
    Ok(())
}
