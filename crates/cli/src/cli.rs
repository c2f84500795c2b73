use std::path::PathBuf;

use clap::builder::Styles;
use clap::builder::styling::AnsiColor;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "wurm")]
#[command(about = "Watch many hosts through persistent shell sessions")]
#[command(version)]
#[command(styles = cli_styles())]
pub struct Cli {
	/// Increase verbosity (-v info, -vv debug)
	#[arg(short, long, global = true, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// Config file (default: $XDG_CONFIG_HOME/wurm/config.json)
	#[arg(short, long, global = true, value_name = "FILE")]
	pub config: Option<PathBuf>,

	#[command(subcommand)]
	pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
	/// Run the probe gateway
	Serve {
		/// Address to bind (overrides config)
		#[arg(long)]
		host: Option<String>,

		/// Port to bind (overrides config)
		#[arg(short, long)]
		port: Option<u16>,

		/// Probe catalog JSON (overrides config)
		#[arg(long, value_name = "FILE")]
		catalog: Option<PathBuf>,
	},

	/// Connect to a gateway and print probe results as they arrive
	Watch {
		/// Hosts to watch
		#[arg(required = true)]
		hosts: Vec<String>,

		/// Gateway URL (default: ws://<config host>:<config port>/)
		#[arg(long)]
		url: Option<String>,

		/// Plain shared secret (default: decoded config token)
		#[arg(long)]
		token: Option<String>,
	},

	/// List the probe catalog
	Probes {
		/// Probe catalog JSON (overrides config)
		#[arg(long, value_name = "FILE")]
		catalog: Option<PathBuf>,

		/// Print the metadata sent to clients as JSON
		#[arg(long)]
		json: bool,
	},

	/// Encode a shared secret for the config file
	Token {
		secret: String,

		/// Store the encoded token in the config file
		#[arg(long)]
		save: bool,
	},
}

fn cli_styles() -> Styles {
	Styles::styled()
		.header(AnsiColor::Green.on_default().bold())
		.usage(AnsiColor::Green.on_default().bold())
		.literal(AnsiColor::Cyan.on_default())
		.placeholder(AnsiColor::Cyan.on_default())
		.valid(AnsiColor::Cyan.on_default())
}
