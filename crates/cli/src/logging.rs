use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

pub fn init_logging(verbosity: u8) {
	// A long-running gateway logs failed probes and auth at warn; that is all
	// an unattended `serve` should print. `-v` adds connections and the
	// catalog but keeps per-session start/stop lines quiet, `-vv` traces every
	// command.
	let filter = match verbosity {
		0 => "warn",
		1 => "info,wurm_runtime=warn",
		_ => "debug",
	};

	let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

	let stderr = std::io::stderr.with_max_level(tracing::Level::TRACE);

	tracing_subscriber::fmt()
		.with_env_filter(env_filter)
		.with_writer(stderr)
		.with_target(true)
		.with_level(true)
		.compact()
		.init();
}
