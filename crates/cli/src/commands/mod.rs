mod probes;
mod serve;
mod token;
mod watch;

use crate::cli::{Cli, Commands};
use crate::config::ServerConfig;
use crate::error::Result;

pub async fn dispatch(cli: Cli) -> Result<()> {
	let config = ServerConfig::load(cli.config.as_deref())?;

	match cli.command {
		Commands::Serve { host, port, catalog } => serve::execute(config, host, port, catalog).await,
		Commands::Watch { hosts, url, token } => watch::execute(&config, hosts, url, token).await,
		Commands::Probes { catalog, json } => probes::execute(&config, catalog, json),
		Commands::Token { secret, save } => token::execute(config, cli.config.as_deref(), &secret, save),
	}
}
