use chrono::Utc;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Mutex;

/// The type of logger to use.
#[derive(Debug, Clone)]
pub enum LoggerType {
	/// Leave the `log` crate facade alone and let the host application install its own logger.
	LogFacade,
	/// A logger that writes to a specified file.
	/// The file will be created if it does not exist and its parent directories will be created as needed.
	File {
		/// The path to the log file.
		path: PathBuf,
	},
}

#[derive(Debug)]
struct FileLogger {
	file: Mutex<fs::File>,
}

impl log::Log for FileLogger {
	fn enabled(&self, metadata: &log::Metadata) -> bool {
		metadata.level() <= log::Level::Debug
	}

	fn log(&self, record: &log::Record) {
		if !self.enabled(record.metadata()) {
			return;
		}

		let mut file = self.file.lock().unwrap();
		let mut buffer = BufWriter::new(&mut *file);
		let _ = writeln!(
			&mut buffer,
			"{} {:<5} [{}:{}] {}",
			Utc::now().format("%Y-%m-%d %H:%M:%S"),
			record.level().to_string(),
			record.module_path().unwrap_or("?"),
			record.line().unwrap_or(0),
			record.args()
		);
	}

	fn flush(&self) {
		let _ = self.file.lock().unwrap().flush();
	}
}

pub(crate) fn init(logger_type: &LoggerType) -> Result<(), ()> {
	match logger_type {
		LoggerType::LogFacade => Ok(()),
		LoggerType::File { path } => {
			if path.parent().is_some_and(|p| !p.exists()) {
				fs::create_dir_all(path.parent().unwrap()).map_err(|_| ())?;
			}
			let file =
				fs::OpenOptions::new().create(true).append(true).open(path).map_err(|_| ())?;
			// A second hub in the same process keeps the first logger. Not an error.
			let _ = log::set_boxed_logger(Box::new(FileLogger { file: Mutex::new(file) }));
			log::set_max_level(log::LevelFilter::Debug);
			Ok(())
		},
	}
}
