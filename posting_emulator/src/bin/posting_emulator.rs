use std::{
    env,
    io::{self, BufRead, Write},
    path::Path,
};

use clap::{Args, Parser, Subcommand};
use jemallocator::Jemalloc;
use metrics_exporter_prometheus::PrometheusBuilder;
use posting_emulator::{
    config::{self, Config, Telemetry},
    emulator::{self, Emulator},
    sampler::mysql::MySql,
    sink::{Registry, SinkKind},
};
use tokio::{
    runtime::Builder,
    signal,
    time::{self, Duration},
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

const CONFIG_ENV_VAR: &str = "POSTING_EMULATOR_CONFIG";

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Config(#[from] config::Error),
    #[error("Invalid configuration: input ended before a sink was selected")]
    NoSink,
    #[error("Emulator failed: {0}")]
    Emulator(#[from] emulator::Error),
    #[error("Failed to install prometheus exporter: {0}")]
    Prometheus(#[from] metrics_exporter_prometheus::BuildError),
}

fn default_config_path() -> String {
    "config.json".to_string()
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the emulator with specified configuration
    Run(RunCommand),
    /// Validate configuration file and exit
    ConfigCheck(ConfigCheckCommand),
}

#[derive(Args)]
struct RunCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
    /// the sink to send to, kafka or kinesis, overriding the configuration
    #[clap(long)]
    sink: Option<SinkKind>,
    /// stop after this many cycles rather than running until ctrl-c
    #[clap(long)]
    cycles: Option<u64>,
    /// the maximum time to wait, in seconds, for controlled shutdown
    #[clap(long, default_value_t = 30)]
    max_shutdown_delay: u16,
}

#[derive(Args)]
struct ConfigCheckCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
}

/// Load configuration, preferring contents passed through the environment over
/// the file at `config_path`.
fn load_config(config_path: &Path, env_contents: Option<String>) -> Result<Config, Error> {
    let config = if let Some(contents) = env_contents {
        debug!("Using config from env var '{CONFIG_ENV_VAR}'");
        config::parse(&contents)
    } else {
        debug!("Attempting to open configuration file at: {config_path:?}");
        config::load_config_from_path(config_path)
    };
    config.map_err(|err| {
        error!("Configuration validation failed: {err}");
        Error::Config(err)
    })
}

fn check_config(config_path: &Path, env_contents: Option<String>) -> Result<(), Error> {
    let config = load_config(config_path, env_contents)?;
    match config.sink {
        Some(sink) => {
            config.validate(sink)?;
        }
        None => config.pause.validate()?,
    }
    info!("Configuration file is valid");
    Ok(())
}

/// Ask on `output` which sink to use until `input` yields a valid answer.
fn prompt_sink<R, W>(input: &mut R, output: &mut W) -> Result<SinkKind, Error>
where
    R: BufRead,
    W: Write,
{
    loop {
        write!(output, "Would you like to send data to 'Kafka' or 'Kinesis': ")?;
        output.flush()?;
        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            return Err(Error::NoSink);
        }
        match line.parse() {
            Ok(sink) => return Ok(sink),
            Err(_) => writeln!(output, "Invalid input. Try again.")?,
        }
    }
}

/// The command line wins over the configuration file; the prompt runs only when
/// neither names a sink.
fn resolve_sink<R, W>(
    flag: Option<SinkKind>,
    config: &Config,
    input: &mut R,
    output: &mut W,
) -> Result<SinkKind, Error>
where
    R: BufRead,
    W: Write,
{
    match flag.or(config.sink) {
        Some(sink) => Ok(sink),
        None => prompt_sink(input, output),
    }
}

fn install_telemetry(telemetry: Telemetry) -> Result<(), Error> {
    let mut builder = PrometheusBuilder::new().with_http_listener(telemetry.prometheus_addr);
    for (k, v) in telemetry.global_labels {
        builder = builder.add_global_label(k, v);
    }
    builder.install()?;
    info!(
        "Serving prometheus metrics on {addr}",
        addr = telemetry.prometheus_addr
    );
    Ok(())
}

async fn inner_main(
    config: Config,
    registry: Registry,
    cycles: Option<u64>,
    max_shutdown_delay: Duration,
) -> Result<(), Error> {
    if let Some(telemetry) = config.telemetry.clone() {
        install_telemetry(telemetry)?;
    }

    let (shutdown_watcher, shutdown_broadcast) = posting_signal::signal();
    let database = MySql::new(&config.db);
    let mut emulator = Emulator::new(&config, registry, database, shutdown_watcher)?;
    if let Some(cycles) = cycles {
        emulator = emulator.with_cycle_limit(cycles);
    }

    let spin = emulator.spin();
    tokio::pin!(spin);
    tokio::select! {
        () = &mut spin => {
            info!("emulator finished");
            return Ok(());
        }
        _ = signal::ctrl_c() => {
            info!("received ctrl-c");
        }
    }

    // The loop observes the signal between cycles; a cycle in flight is given
    // the shutdown delay to finish. The emulator drops its watcher on return.
    let drain = async {
        tokio::join!(shutdown_broadcast.signal_and_wait(), &mut spin);
    };
    if time::timeout(max_shutdown_delay, drain).await.is_err() {
        warn!(
            "Emulator did not stop within {} seconds, abandoning in-flight cycle",
            max_shutdown_delay.as_secs()
        );
    }
    Ok(())
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting posting-emulator {version} run.");

    let cli = Cli::parse();
    let args = match cli.command {
        Commands::Run(run_cmd) => run_cmd,
        Commands::ConfigCheck(config_check_cmd) => {
            match check_config(
                Path::new(&config_check_cmd.config_path),
                env::var(CONFIG_ENV_VAR).ok(),
            ) {
                Ok(()) => std::process::exit(0),
                Err(_) => std::process::exit(1),
            }
        }
    };

    let config = load_config(Path::new(&args.config_path), env::var(CONFIG_ENV_VAR).ok())?;
    let sink = resolve_sink(
        args.sink,
        &config,
        &mut io::stdin().lock(),
        &mut io::stdout().lock(),
    )?;
    let registry = config.validate(sink)?;
    info!("Selected sink: {sink}");

    let max_shutdown_delay = Duration::from_secs(args.max_shutdown_delay.into());
    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(config, registry, args.cycles, max_shutdown_delay));
    info!(
        "Shutting down runtime with a {} second delay. May leave orphaned tasks.",
        max_shutdown_delay.as_secs(),
    );
    runtime.shutdown_timeout(max_shutdown_delay);
    info!("Bye. :)");
    res
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use posting_emulator::sink;

    use super::*;

    const CONFIG: &str = r#"
db:
  host: "localhost"
  user: "emulator"
  password: "secret"
  name: "pins"
  port: 3306
endpoints:
  rest:
    pin: "http://localhost:8082/topics/0a1b.pin"
    geo: "http://localhost:8082/topics/0a1b.geo"
    user: "http://localhost:8082/topics/0a1b.user"
user_id: "0a1b"
"#;

    fn prompt(input: &str) -> (Result<SinkKind, Error>, String) {
        let mut input = Cursor::new(input.as_bytes().to_vec());
        let mut output = Vec::new();
        let result = prompt_sink(&mut input, &mut output);
        (result, String::from_utf8(output).expect("not utf-8"))
    }

    #[test]
    fn prompt_accepts_any_case() {
        let (result, output) = prompt("Kinesis\n");
        assert_eq!(result.expect("prompt failed"), SinkKind::Kinesis);
        assert_eq!(output, "Would you like to send data to 'Kafka' or 'Kinesis': ");
    }

    #[test]
    fn prompt_retries_on_invalid_input() {
        let (result, output) = prompt("rabbitmq\n\nKAFKA\n");
        assert_eq!(result.expect("prompt failed"), SinkKind::Kafka);
        assert_eq!(output.matches("Invalid input. Try again.").count(), 2);
        assert_eq!(output.matches("Would you like to send data").count(), 3);
    }

    #[test]
    fn prompt_fails_at_end_of_input() {
        let (result, _) = prompt("nope\n");
        assert!(matches!(result, Err(Error::NoSink)));
    }

    #[test]
    fn flag_wins_over_config_and_prompt() {
        let mut config = config::parse(CONFIG).expect("invalid config");
        config.sink = Some(SinkKind::Kafka);
        let mut input = Cursor::new(Vec::new());
        let mut output = Vec::new();

        let sink = resolve_sink(Some(SinkKind::Kinesis), &config, &mut input, &mut output)
            .expect("resolve failed");
        assert_eq!(sink, SinkKind::Kinesis);

        let sink = resolve_sink(None, &config, &mut input, &mut output).expect("resolve failed");
        assert_eq!(sink, SinkKind::Kafka);
        assert!(output.is_empty());
    }

    #[test]
    fn prompt_runs_when_sink_unset() {
        let config = config::parse(CONFIG).expect("invalid config");
        let mut input = Cursor::new(b"kafka\n".to_vec());
        let mut output = Vec::new();

        let sink = resolve_sink(None, &config, &mut input, &mut output).expect("resolve failed");
        assert_eq!(sink, SinkKind::Kafka);
        assert!(!output.is_empty());
    }

    #[test]
    fn env_contents_win_over_path() {
        let config = load_config(Path::new("/does/not/exist.json"), Some(CONFIG.to_string()))
            .expect("load failed");
        assert_eq!(config.user_id, "0a1b");
    }

    #[test]
    fn check_config_validates_configured_sink() {
        let missing_streams = format!("{CONFIG}sink: kinesis\n");
        let err = check_config(Path::new("unused"), Some(missing_streams))
            .expect_err("check should fail");
        assert!(matches!(
            err,
            Error::Config(config::Error::Sink(sink::Error::MissingSection { .. }))
        ));

        let with_rest = format!("{CONFIG}sink: kafka\n");
        assert!(check_config(Path::new("unused"), Some(with_rest)).is_ok());
    }

    #[test]
    fn cli_parses_run_arguments() {
        let cli = Cli::try_parse_from([
            "posting-emulator",
            "run",
            "--sink",
            " Kinesis ",
            "--cycles",
            "3",
        ])
        .expect("parse failed");
        match cli.command {
            Commands::Run(run) => {
                assert_eq!(run.sink, Some(SinkKind::Kinesis));
                assert_eq!(run.cycles, Some(3));
                assert_eq!(run.config_path, "config.json");
                assert_eq!(run.max_shutdown_delay, 30);
            }
            Commands::ConfigCheck(_) => panic!("expected run"),
        }
    }

    #[test]
    fn cli_rejects_unknown_sink() {
        assert!(Cli::try_parse_from(["posting-emulator", "run", "--sink", "rabbitmq"]).is_err());
    }
}
