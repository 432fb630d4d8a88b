use chrono::Local;
use console::style;
use env_logger::{Builder, Env};
use log::{Level, LevelFilter};
use std::io::Write;

/// `SAFEBOX_LOG` takes precedence over the `--verbose` default
const LOG_ENV: &str = "SAFEBOX_LOG";

/// Log to stderr; stdout stays reserved for reports.
///
/// `--verbose` only raises engine modules to debug, which includes one
/// line per telemetry tick.
pub fn init_logger(verbose: bool) {
    let mut builder = Builder::from_env(Env::default().filter(LOG_ENV));
    if std::env::var_os(LOG_ENV).is_none() {
        let engine = if verbose { LevelFilter::Debug } else { LevelFilter::Warn };
        builder
            .filter_level(LevelFilter::Warn)
            .filter_module("safebox", engine);
    }

    builder
        .format(|buf, record| {
            let tag = match record.level() {
                Level::Error => style("error").red().bold(),
                Level::Warn => style(" warn").yellow().bold(),
                Level::Info => style(" info").green(),
                Level::Debug => style("debug").cyan(),
                Level::Trace => style("trace").dim(),
            };
            let module = record
                .module_path()
                .and_then(|path| path.rsplit("::").next())
                .unwrap_or("safebox");
            writeln!(
                buf,
                "{} {} {} {}",
                style(Local::now().format("%H:%M:%S%.3f")).dim(),
                tag,
                style(module).dim(),
                record.args()
            )
        })
        .init();
}
