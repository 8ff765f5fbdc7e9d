pub mod horizon;
pub mod keypair;
pub mod tracker;
pub mod transaction;

pub use horizon::{HorizonClient, HorizonConfig, HorizonError, LedgerClient};
pub use keypair::Keypair;
pub use tracker::{LedgerLock, LedgerNumberTracker};
