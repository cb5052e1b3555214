use std::env;
use std::sync::Arc;

use anyhow::Context;
use log::info;

use hashledger::blockchain::{Blockchain, KeyPair, SystemClock, Transaction};
use hashledger::ChainConfig;

// Loads the chain parameters from the path given as first argument, if any
fn load_config() -> anyhow::Result<ChainConfig> {
    match env::args().nth(1) {
        Some(path) => {
            let config = ChainConfig::load(&path)
                .with_context(|| format!("failed to load config from {}", path))?;
            info!("Loaded config from {}", path);
            Ok(config)
        }
        None => Ok(ChainConfig::default()),
    }
}

fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let blockchain = Blockchain::with_config(load_config()?, Arc::new(SystemClock))?;

    let wallet1 = KeyPair::generate();
    let wallet2 = KeyPair::generate();
    info!("Wallet 1 address: {}", wallet1.address());
    info!("Wallet 2 address: {}", wallet2.address());

    let mut transfer = Transaction::new(wallet1.address().clone(), wallet2.address().clone(), 50);
    transfer.sign(&wallet1)?;
    blockchain.add_transaction(transfer)?;

    info!("Starting the miner...");
    blockchain.mine_pending_transactions(wallet1.address())?;

    info!("Wallet 1 balance: {}", blockchain.get_balance_of_address(wallet1.address()));
    info!("Wallet 2 balance: {}", blockchain.get_balance_of_address(wallet2.address()));
    info!("Is blockchain valid? {}", blockchain.is_chain_valid());

    Ok(())
}
