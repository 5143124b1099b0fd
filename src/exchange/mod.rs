pub mod factory;
pub mod rules;
pub mod traits;

pub use factory::{build_client, build_client_table, ClientTable};
pub use rules::SymbolRules;
pub use traits::{
    ensure_core_assets, fill_within_tolerance, maker_adjusted_price, min_profitable_sell_price,
    parse_exchange, AssetBalance, BalanceMap, Exchange, ExchangeClient, OrderSide, OrderSnapshot,
    BTC, MAKER_PRICE_OFFSET, USDC,
};
