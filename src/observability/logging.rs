use fern::colors::{Color, ColoredLevelConfig};
use log::LevelFilter;

/// Install the global `fern` dispatcher writing timestamped lines to stdout.
/// The `bifrost` crate logs at `level`; dependencies are held to warnings.
pub fn init_logging(level: log::Level) -> anyhow::Result<()> {
	let colors = ColoredLevelConfig::new()
		.error(Color::Red)
		.warn(Color::Yellow)
		.info(Color::Green)
		.debug(Color::Blue)
		.trace(Color::Magenta);

	fern::Dispatch::new()
		.format(move |out, message, record| {
			out.finish(format_args!(
				"{} {:<5} [{}] {}",
				chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
				colors.color(record.level()),
				record.target(),
				message
			))
		})
		.level(LevelFilter::Warn)
		.level_for("bifrost", level.to_level_filter())
		.level_for("vanopticon_bifrost", level.to_level_filter())
		.chain(std::io::stdout())
		.apply()
		.map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;

	Ok(())
}
