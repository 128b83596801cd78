pub mod config;
pub mod daemon;
pub mod error;
pub mod inference;
pub mod model;

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use config::{ModelEntry, SecurityMode, ServeConfig};
use daemon::http::serve_http;
use daemon::{ClientConfig, ModelServer, ServingClient, SharedKey, TransportSecurity};

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "fasttext-serving",
    version,
    about = "Streaming prediction server for fastText-style text classifiers"
)]
pub struct Cli {
    /// Config file (defaults to config.toml in the platform config dir)
    #[arg(long, global = true, env = "FASTTEXT_SERVING_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the prediction server
    Serve(ServeArgs),
    /// Classify texts through a running server (JSON lines on stdout)
    Predict(PredictArgs),
    /// Check that a server is up
    Health(ConnectArgs),
    /// Show loaded models and counters of a running server
    Status(ConnectArgs),
    /// Print a model file's metadata as JSON
    Inspect {
        /// Model file
        path: PathBuf,
    },
    /// Write a new random transport key
    Keygen {
        /// Destination file
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Generate shell completions to stdout
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate man page to stdout
    Man,
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Address to bind
    #[arg(long)]
    pub address: Option<String>,

    /// Streaming protocol port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Also serve the HTTP batch endpoint on this port
    #[arg(long)]
    pub http_port: Option<u16>,

    /// Model to load, as PATH or NAME=PATH (repeatable)
    #[arg(short, long = "model", value_name = "[NAME=]PATH")]
    pub models: Vec<ModelEntry>,

    /// Model used when a client does not name one
    #[arg(long)]
    pub default_model: Option<String>,

    /// Concurrent sessions before new ones are refused
    #[arg(long)]
    pub max_sessions: Option<usize>,

    /// Largest message accepted or sent, in bytes
    #[arg(long)]
    pub max_message_bytes: Option<usize>,

    /// Per-prediction deadline in milliseconds
    #[arg(long)]
    pub request_timeout_ms: Option<u64>,

    /// Transport protection
    #[arg(long, value_enum)]
    pub security: Option<SecurityMode>,

    /// Hex key file for encrypted mode
    #[arg(long)]
    pub key_file: Option<PathBuf>,

    /// Tokio worker threads
    #[arg(long)]
    pub workers: Option<usize>,

    /// Write daily rolling logs to this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

impl ServeArgs {
    /// Command-line layer: flags override file and environment.
    pub fn apply(self, cfg: &mut ServeConfig) {
        if let Some(address) = self.address {
            cfg.address = address;
        }
        if let Some(port) = self.port {
            cfg.port = port;
        }
        if let Some(port) = self.http_port {
            cfg.http_port = Some(port);
        }
        if !self.models.is_empty() {
            cfg.models = self.models;
        }
        if let Some(name) = self.default_model {
            cfg.default_model = Some(name);
        }
        if let Some(n) = self.max_sessions {
            cfg.max_sessions = n;
        }
        if let Some(n) = self.max_message_bytes {
            cfg.max_message_bytes = n;
        }
        if let Some(ms) = self.request_timeout_ms {
            cfg.request_timeout_ms = Some(ms);
        }
        if let Some(mode) = self.security {
            cfg.security.mode = mode;
        }
        if let Some(path) = self.key_file {
            cfg.security.key_file = Some(path);
        }
        if let Some(n) = self.workers {
            cfg.worker_threads = Some(n);
        }
        if let Some(dir) = self.log_dir {
            cfg.log_dir = Some(dir);
        }
    }
}

#[derive(Args, Debug, Default)]
pub struct ConnectArgs {
    /// Server address as HOST:PORT
    #[arg(long, env = "FASTTEXT_SERVING_SERVER")]
    pub server: Option<String>,

    /// Hex key file; enables encryption
    #[arg(long)]
    pub key_file: Option<PathBuf>,
}

impl ConnectArgs {
    fn client_config(self) -> Result<ClientConfig> {
        let mut cfg = ClientConfig::from_env()?;
        if let Some(server) = self.server {
            cfg.address = server;
        }
        if let Some(path) = self.key_file {
            cfg.security = TransportSecurity::Encrypted(SharedKey::from_file(&path)?);
        }
        Ok(cfg)
    }
}

#[derive(Args, Debug)]
pub struct PredictArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    /// Number of labels per text
    #[arg(short, long, default_value_t = inference::DEFAULT_K)]
    pub k: i32,

    /// Minimum probability of a returned label
    #[arg(short, long, default_value_t = inference::DEFAULT_THRESHOLD)]
    pub threshold: f32,

    /// Model to use (server default when omitted)
    #[arg(long)]
    pub model: Option<String>,

    /// Texts to classify; one per line from stdin when omitted
    pub texts: Vec<String>,
}

/// Install the global subscriber: stderr, plus a daily rolling file when
/// `log_dir` is set. `RUST_LOG` overrides `default_level`.
pub fn init_logging(default_level: &str, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log dir {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "fasttext-serving.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            tracing_subscriber::registry()
                .with(filter())
                .with(stderr_layer)
                .with(file_layer)
                .try_init()?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter())
                .with(stderr_layer)
                .try_init()?;
            Ok(None)
        }
    }
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => {
            let mut cfg = ServeConfig::load(cli.config.as_deref())?;
            cfg.apply_env()?;
            args.apply(&mut cfg);
            serve(cfg)
        }
        Commands::Predict(args) => {
            let _ = init_logging("warn", None)?;
            run_predict(args)
        }
        Commands::Health(args) => {
            let _ = init_logging("warn", None)?;
            let health = ServingClient::new(args.client_config()?).health()?;
            println!("{}", serde_json::to_string_pretty(&health)?);
            Ok(())
        }
        Commands::Status(args) => {
            let _ = init_logging("warn", None)?;
            let status = ServingClient::new(args.client_config()?).status()?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Commands::Inspect { path } => {
            let model = model::format::read_model(&path, None)?;
            let info = Arc::new(model).info();
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(())
        }
        Commands::Keygen { path, force } => run_keygen(&path, force),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "fasttext-serving", &mut std::io::stdout());
            Ok(())
        }
        Commands::Man => {
            let cmd = Cli::command();
            let man = clap_mangen::Man::new(cmd);
            let mut out = std::io::stdout();
            man.render(&mut out)?;
            Ok(())
        }
    }
}

fn serve(cfg: ServeConfig) -> Result<()> {
    let _guard = init_logging("info", cfg.log_dir.as_deref())?;
    cfg.validate()?;
    let options = cfg.server_options()?;
    let store = Arc::new(cfg.load_store().context("failed to load models")?);

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all().thread_name("fasttext-serving");
    if let Some(n) = cfg.worker_threads {
        builder.worker_threads(n);
    }
    let runtime = builder.build().context("failed to start runtime")?;

    runtime.block_on(async move {
        let addr = cfg.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let server = ModelServer::new(options, store);

        let http = match cfg.http_addr() {
            Some(http_addr) => {
                let listener = TcpListener::bind(&http_addr)
                    .await
                    .with_context(|| format!("failed to bind {http_addr}"))?;
                Some(tokio::spawn(serve_http(server.state(), listener)))
            }
            None => None,
        };

        let handle = server.handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                handle.shutdown();
            }
        });

        server.serve(listener).await?;
        if let Some(task) = http {
            task.await??;
        }
        info!("Goodbye");
        Ok(())
    })
}

fn run_predict(args: PredictArgs) -> Result<()> {
    let PredictArgs {
        connect,
        k,
        threshold,
        model,
        texts,
    } = args;
    let mut cfg = connect.client_config()?;
    if model.is_some() {
        cfg.model = model;
    }
    let client = ServingClient::new(cfg);

    let inputs: Box<dyn Iterator<Item = String> + Send> = if texts.is_empty() {
        Box::new(BufReader::new(std::io::stdin()).lines().map_while(Result::ok))
    } else {
        Box::new(texts.into_iter())
    };

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for prediction in client.predict(inputs, k, threshold)? {
        serde_json::to_writer(&mut out, &prediction?)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

fn run_keygen(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let key = SharedKey::generate();

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    writeln!(file, "{}", key.to_hex().as_str())?;
    eprintln!("Wrote transport key to {}", path.display());
    Ok(())
}
