use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::Parser;
use mongo_oplog::{blocking, CheckpointConf, OplogSyncConf};
use tracing::{error, info, Level};

#[derive(Parser, Debug)]
#[clap(version = env!("CARGO_PKG_VERSION"), author = env!("CARGO_PKG_AUTHORS"))]
/// Replay the oplog of one mongodb replica set onto another deployment.
struct Opts {
    /// toml configuration file, command line options override it.
    #[clap(short, long)]
    conf: Option<PathBuf>,
    /// source uri, must be a replica set member.
    #[clap(long)]
    src_uri: Option<String>,
    /// destination uri.
    #[clap(long)]
    dst_uri: Option<String>,
    /// namespace to skip, `db` or `db.coll`, can be repeated.
    #[clap(short = 'x', long)]
    exclude: Vec<String>,
    /// namespace to replay, `db` or `db.coll`, can be repeated.  Excludes are ignored when given.
    #[clap(long = "ns")]
    include: Vec<String>,
    /// rename rule `old=new`, can be repeated.
    #[clap(long)]
    rename: Vec<String>,
    /// oplog namespace of the source.
    #[clap(long)]
    oplog_ns: Option<String>,
    /// start this many seconds ago, only used when no checkpoint exists yet: a saved checkpoint always wins.
    #[clap(short = 's', long = "seconds")]
    seconds: Option<u32>,
    /// keep tailing the oplog.
    #[clap(short, long)]
    follow: bool,
    /// save the checkpoint in this file instead of the destination.
    #[clap(long)]
    resume_file: Option<PathBuf>,
    /// checkpoint record key in the destination.
    #[clap(long)]
    checkpoint_key: Option<String>,
    /// entries between two checkpoint saves.
    #[clap(long)]
    checkpoint_interval: Option<usize>,
    /// entries buffered between reading and applying.
    #[clap(long)]
    buffer_size: Option<usize>,
    /// connect and server selection timeout, in seconds.
    #[clap(long)]
    timeout: Option<u64>,
    /// retries for connectivity errors.
    #[clap(long)]
    max_retries: Option<u32>,
    /// first retry delay, in milliseconds.
    #[clap(long)]
    retry_backoff_ms: Option<u64>,
    /// fail on malformed oplog entries instead of skipping them.
    #[clap(long)]
    halt_on_malformed: bool,
    /// log file path, if not specified, all log information will be output to stdout.
    #[clap(long)]
    log_path: Option<String>,
    /// log level.
    #[clap(long, default_value = "info")]
    log_level: Level,
}

impl Opts {
    fn into_conf(self) -> Result<OplogSyncConf, Box<dyn std::error::Error>> {
        let mut conf = match &self.conf {
            Some(path) => OplogSyncConf::from_file(path)?,
            None => {
                let src_uri = self.src_uri.clone().ok_or("--src-uri is required without --conf")?;
                let dst_uri = self.dst_uri.clone().ok_or("--dst-uri is required without --conf")?;
                OplogSyncConf::new(src_uri, dst_uri)
            }
        };

        if let Some(src_uri) = self.src_uri {
            conf.src_uri = src_uri;
        }
        if let Some(dst_uri) = self.dst_uri {
            conf.dst_uri = dst_uri;
        }
        if !self.exclude.is_empty() {
            conf.exclude = self.exclude;
        }
        if !self.include.is_empty() {
            conf.include = self.include;
        }
        if !self.rename.is_empty() {
            conf.rename = self.rename;
        }
        if let Some(oplog_ns) = self.oplog_ns {
            conf.oplog_ns = oplog_ns;
        }
        if self.seconds.is_some() {
            conf.start_seconds_ago = self.seconds;
        }
        conf.follow |= self.follow;
        if let Some(path) = self.resume_file {
            conf.checkpoint = CheckpointConf::File { path };
        }
        if self.checkpoint_key.is_some() {
            conf.checkpoint_key = self.checkpoint_key;
        }
        if let Some(interval) = self.checkpoint_interval {
            conf.checkpoint_interval = interval;
        }
        if let Some(buffer_size) = self.buffer_size {
            conf.buffer_size = buffer_size;
        }
        if let Some(timeout) = self.timeout {
            conf.timeout_secs = timeout;
        }
        if let Some(max_retries) = self.max_retries {
            conf.max_retries = max_retries;
        }
        if let Some(backoff) = self.retry_backoff_ms {
            conf.retry_backoff_ms = backoff;
        }
        conf.halt_on_malformed |= self.halt_on_malformed;
        Ok(conf)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opts: Opts = Opts::parse();
    let collector = tracing_subscriber::fmt().with_max_level(opts.log_level);
    let (non_blocking, guard) = match &opts.log_path {
        Some(path) => {
            let path = Path::new(path);
            let dir_name = path.parent().unwrap_or_else(|| Path::new("."));
            let file_name = path.file_name().ok_or("--log-path needs a file name")?;
            let file_appender = tracing_appender::rolling::daily(dir_name, file_name);
            tracing_appender::non_blocking(file_appender)
        }
        None => tracing_appender::non_blocking(std::io::stdout()),
    };
    collector.with_writer(non_blocking).init();

    let conf = opts.into_conf()?;
    let stop = Arc::new(AtomicBool::new(false));
    #[cfg(unix)]
    {
        use signal_hook::consts::{SIGINT, SIGTERM};
        signal_hook::flag::register(SIGINT, Arc::clone(&stop))?;
        signal_hook::flag::register(SIGTERM, Arc::clone(&stop))?;
    }

    info!(follow = conf.follow, "Starting mongo oplog sync...");
    match blocking::sync_once(&conf, stop) {
        Ok(summary) => {
            info!(?summary, "Mongo oplog sync complete.");
            Ok(())
        }
        Err(e) => {
            error!(stage = ?e.stage(), error = %e, "Mongo oplog sync failed.");
            eprintln!("{}", e);
            // flush buffered logs, exit skips destructors.
            drop(guard);
            std::process::exit(1);
        }
    }
}
