use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, WurmError>;

#[derive(Debug, Error)]
pub enum WurmError {
	#[error("configuration error: {0}")]
	Config(String),

	#[error("failed to read config {path}")]
	ConfigRead {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("failed to bind {addr}")]
	Bind {
		addr: String,
		#[source]
		source: std::io::Error,
	},

	#[error(transparent)]
	Core(#[from] wurm::Error),

	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Json(#[from] serde_json::Error),

	#[error(transparent)]
	Anyhow(#[from] anyhow::Error),
}
