use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::adapters::{BinanceClient, KrakenClient, KucoinClient, MexcClient};
use crate::config::AppConfig;
use crate::error::Result;

use super::{Exchange, ExchangeClient};

/// Client set keyed by exchange, built once at startup and injected
/// into the engine and scheduler.
pub type ClientTable = HashMap<Exchange, Arc<dyn ExchangeClient>>;

/// Construct the client for one exchange.
pub fn build_client(
    exchange: Exchange,
    config: &AppConfig,
    dry_run: bool,
) -> Result<Arc<dyn ExchangeClient>> {
    let settings = config.exchanges.get(exchange);
    let client: Arc<dyn ExchangeClient> = match exchange {
        Exchange::Binance => Arc::new(BinanceClient::new(settings, dry_run)?),
        Exchange::Mexc => Arc::new(MexcClient::new(settings, dry_run)?),
        Exchange::Kucoin => Arc::new(KucoinClient::new(settings, dry_run)?),
        Exchange::Kraken => Arc::new(KrakenClient::new(settings, dry_run)?),
    };
    Ok(client)
}

/// Construct clients for every enabled exchange.
pub fn build_client_table(config: &AppConfig) -> Result<ClientTable> {
    let dry_run = config.dry_run.enabled;
    let mut table = ClientTable::new();
    for exchange in config.exchanges.enabled() {
        table.insert(exchange, build_client(exchange, config, dry_run)?);
        info!(%exchange, dry_run, "exchange client ready");
    }
    Ok(table)
}
