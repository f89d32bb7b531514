/// A bitcoind wallet as the ledger
pub mod bitcoind;

pub use self::bitcoind::BitcoindLedger;
