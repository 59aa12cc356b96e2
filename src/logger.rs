use log::{LevelFilter, Metadata, Record};

struct Logger;

impl log::Log for Logger {
	fn enabled(&self, _: &Metadata) -> bool {
		true
	}

	fn log(&self, record: &Record) {
		eprintln!("shuriken: [{}] {}", record.level(), record.args());
	}

	fn flush(&self) {}
}

static LOGGER: Logger = Logger;

pub fn init(verbose: bool) {
	log::set_logger(&LOGGER).expect("logger already installed");
	log::set_max_level(if verbose {
		LevelFilter::Debug
	} else {
		LevelFilter::Info
	});
}
