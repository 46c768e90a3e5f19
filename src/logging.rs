use std::io::Write;

use log::LevelFilter;

/// Install the process-wide logger: `<local time> - <LEVEL> - <message>`.
///
/// `RUST_LOG`, when set, overrides `level`. Calling this more than once keeps
/// the first logger.
pub fn init_logging(level: LevelFilter) {
    let mut builder = env_logger::Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - {} - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter(None, level);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    if builder.try_init().is_err() {
        log::debug!("Logger already initialized");
    }
}
