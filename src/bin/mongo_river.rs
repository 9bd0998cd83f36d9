use clap::Parser;
use mongo_river::{EsTarget, MongoSource, RiverRegistry, RiversConfig};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[clap(version = env!("CARGO_PKG_VERSION"), author = env!("CARGO_PKG_AUTHORS"))]
struct Opts {
    /// configuration file path, holds one `[[river]]` table per river.
    #[clap(short, long, default_value = "config.toml")]
    conf: String,
    /// log file path, if not specified, all log information will be output to stdout.
    #[clap(long)]
    log_path: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opts: Opts = Opts::parse();
    let collector = tracing_subscriber::fmt();
    let (non_blocking, _guard) = match opts.log_path {
        Some(path) => {
            let path = Path::new(&path);
            let dir_name = path.parent().unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| format!("invalid log path {:?}", path))?;
            let file_appender = tracing_appender::rolling::daily(dir_name, file_name);
            tracing_appender::non_blocking(file_appender)
        }
        None => tracing_appender::non_blocking(std::io::stdout()),
    };
    collector.with_writer(non_blocking).init();

    let conf = RiversConfig::from_toml(&fs::read_to_string(&opts.conf)?)?;
    if conf.rivers.is_empty() {
        error!(conf = %opts.conf, "No river defined, nothing to do.");
        return Ok(());
    }

    let registry = RiverRegistry::new();
    for river in conf.rivers {
        let source = Arc::new(MongoSource::new(&river.source, river.pipeline.request_timeout())?);
        let target = Arc::new(EsTarget::new(&river.target, river.pipeline.request_timeout())?);
        registry.create(river, source, target)?;
    }
    info!(rivers = ?registry.names(), "Starting rivers...");
    registry.start_all()?;
    registry.wait_all();

    for name in registry.names() {
        let river = registry.get(&name);
        let last_error = river.as_ref().and_then(|r| r.last_error());
        info!(%name, state = ?registry.state(&name), stats = ?registry.statistics(&name), ?last_error, "River finished.");
    }
    Ok(())
}
