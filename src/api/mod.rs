pub mod binance;

pub use binance::BinanceTickerClient;
