use std::process::ExitCode;

use bankledger::config::{CliArgs, Config, LoggingConfig};
use bankledger::{CreateAccountParams, ListParams, Store, StoreError, TransferTxParams};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "bankledger", about = "Double-entry ledger for account transfers")]
struct Cli {
    #[command(flatten)]
    args: CliArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open a new account
    CreateAccount {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        currency: String,
        /// Opening balance in minor units
        #[arg(long, default_value_t = 0)]
        balance: i64,
    },
    /// Show one account
    GetAccount { id: i64 },
    /// List accounts ordered by id
    ListAccounts {
        #[arg(long, default_value_t = 10)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
    /// Move money between two accounts
    Transfer {
        #[arg(long)]
        from: i64,
        #[arg(long)]
        to: i64,
        #[arg(long)]
        amount: i64,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), StoreError> {
    let out = serde_json::to_string_pretty(value)
        .map_err(|e| StoreError::Other(format!("Failed to encode output: {}", e)))?;
    println!("{}", out);
    Ok(())
}

fn run(store: &Store, command: Command) -> Result<(), StoreError> {
    match command {
        Command::CreateAccount { owner, currency, balance } => {
            let account = store.queries()?.create_account(&CreateAccountParams {
                owner,
                balance,
                currency,
            })?;
            print_json(&account)
        }
        Command::GetAccount { id } => print_json(&store.queries()?.get_account(id)?),
        Command::ListAccounts { limit, offset } => {
            print_json(&store.queries()?.list_accounts(&ListParams::new(limit, offset))?)
        }
        Command::Transfer { from, to, amount } => {
            let result = store.transfer_tx(&TransferTxParams {
                from_account_id: from,
                to_account_id: to,
                amount,
            })?;
            print_json(&result)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = Config::load(&cli.args);
    init_tracing(&config.logging);

    let result = config
        .open_store()
        .and_then(|store| run(&store, cli.command));

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
