//! Command-line entry point and service composition for ticketbot.
mod bootstrap_helpers;
mod cli_args;
mod cli_types;
mod startup;

pub use bootstrap_helpers::init_tracing;
pub use cli_args::Cli;
pub use cli_types::CliLedgerBackend;
pub use startup::{build_gateway_state, build_link_store, run_cli};
