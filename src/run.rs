//! Command line: the daemon itself, and clients of a running daemon.

use crate::config::Config;
use crate::daemon::Daemon;
use crate::json_events::{Decoder, Event};
use crate::rpc::{self, Client, Request};
use crate::watch::FileWatcher;
use crate::{signal, stream_server, trace};
use argh::FromArgs;
use serde_json::Value;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(FromArgs)]
/// falcon: an incremental build daemon.
struct Args {
    /// control port of the daemon to talk to [default=4242]
    #[argh(option, default = "4242")]
    port: u16,

    /// progress stream port of the daemon to talk to [default=4343]
    #[argh(option, default = "4343")]
    stream_port: u16,

    /// what to do
    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    Daemon(DaemonArgs),
    Build(BuildArgs),
    Interrupt(InterruptArgs),
    Stop(StopArgs),
    Status(StatusArgs),
    Pid(PidArgs),
    DirtySources(DirtySourcesArgs),
    DirtyTargets(DirtyTargetsArgs),
    InputsOf(InputsOfArgs),
    OutputsOf(OutputsOfArgs),
    HashOf(HashOfArgs),
    SetDirty(SetDirtyArgs),
    Graphviz(GraphvizArgs),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "daemon")]
/// load the build graph and serve builds and queries.
struct DaemonArgs {
    /// TOML config file
    #[argh(option)]
    config: Option<PathBuf>,

    /// build description [default=makefile.json]
    #[argh(option)]
    graph: Option<PathBuf>,

    /// working directory
    #[argh(option, short = 'C')]
    dir: Option<PathBuf>,

    /// control port
    #[argh(option)]
    api_port: Option<u16>,

    /// progress stream port
    #[argh(option)]
    stream_port: Option<u16>,

    /// commands to run in parallel
    #[argh(option, short = 'j')]
    jobs: Option<usize>,

    /// log level, e.g. debug [default=info]
    #[argh(option)]
    log_level: Option<String>,

    /// write a Chrome performance trace to this file
    #[argh(option)]
    trace: Option<String>,

    /// don't watch the working directory for changes
    #[argh(switch)]
    no_watch: bool,

    /// build everything once, then exit
    #[argh(switch)]
    build: bool,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "build")]
/// start a build and follow its progress.
struct BuildArgs {
    /// commands to run in parallel [default from the daemon]
    #[argh(option, short = 'j')]
    jobs: Option<usize>,

    /// targets to build [default=everything]
    #[argh(positional)]
    targets: Vec<String>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "interrupt")]
/// interrupt the running build.
struct InterruptArgs {}

#[derive(FromArgs)]
#[argh(subcommand, name = "stop")]
/// shut the daemon down.
struct StopArgs {}

#[derive(FromArgs)]
#[argh(subcommand, name = "status")]
/// print whether a build is running.
struct StatusArgs {}

#[derive(FromArgs)]
#[argh(subcommand, name = "pid")]
/// print the daemon's process id.
struct PidArgs {}

#[derive(FromArgs)]
#[argh(subcommand, name = "dirty-sources")]
/// print the source files changed since their last build.
struct DirtySourcesArgs {}

#[derive(FromArgs)]
#[argh(subcommand, name = "dirty-targets")]
/// print every target that needs building.
struct DirtyTargetsArgs {}

#[derive(FromArgs)]
#[argh(subcommand, name = "inputs-of")]
/// print the inputs of a target's rule.
struct InputsOfArgs {
    /// target name
    #[argh(positional)]
    target: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "outputs-of")]
/// print the outputs of the rules consuming a target.
struct OutputsOfArgs {
    /// target name
    #[argh(positional)]
    target: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "hash-of")]
/// print the current hash of a target.
struct HashOfArgs {
    /// target name
    #[argh(positional)]
    target: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "set-dirty")]
/// forget a target's last build.
struct SetDirtyArgs {
    /// target name
    #[argh(positional)]
    target: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "graphviz")]
/// print the build graph in graphviz format.
struct GraphvizArgs {}

fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn daemon_config(args: &DaemonArgs) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(dir) = &args.dir {
        config.working_directory = dir.clone();
    }
    if let Some(graph) = &args.graph {
        config.graph = graph.clone();
    }
    if let Some(port) = args.api_port {
        config.api_port = port;
    }
    if let Some(port) = args.stream_port {
        config.stream_port = port;
    }
    if let Some(jobs) = args.jobs {
        config.jobs = jobs;
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    if args.no_watch || args.build {
        config.watch = false;
    }
    config.validate()?;
    Ok(config)
}

fn run_daemon(args: DaemonArgs) -> anyhow::Result<i32> {
    let config = daemon_config(&args)?;
    init_logging(&config.log_level);
    if let Some(path) = &args.trace {
        trace::open(path)?;
    }

    let daemon = trace::scope("daemon::open", || Daemon::open(config))?;
    if args.build {
        return Ok(match daemon.build(&[], None)? {
            Some(true) => 0,
            _ => 1,
        });
    }

    signal::register();
    let config = daemon.config();
    let _rpc = rpc::serve(
        TcpListener::bind(("127.0.0.1", config.api_port))?,
        daemon.clone(),
    )?;
    let _stream = stream_server::serve(
        TcpListener::bind(("127.0.0.1", config.stream_port))?,
        daemon.streams(),
    )?;
    let _watcher = if config.watch {
        Some(FileWatcher::start(daemon.clone())?)
    } else {
        None
    };

    loop {
        if signal::shutdown_requested() {
            daemon.shutdown();
        }
        if daemon.wait_shutdown(Duration::from_millis(200)) {
            break;
        }
    }
    tracing::info!("shut down");
    Ok(0)
}

/// Print a build's progress document as it arrives.  Returns whether the
/// build succeeded.
pub fn report_stream(mut r: impl Read, out: &mut impl Write) -> anyhow::Result<bool> {
    let mut decoder = Decoder::new();
    let mut result = None;
    let mut write_err = None;
    let mut handle = |event: Event| {
        let (path, value) = match event {
            Event::Value { path, value } => (path, value),
            _ => return,
        };
        let text = match &value {
            Value::String(s) => s.as_str(),
            _ => return,
        };
        let written = match path.as_str() {
            "cmds.item.cmd" => writeln!(out, "{}", text),
            "cmds.item.stdout" | "cmds.item.stderr" if !text.is_empty() => write!(out, "{}", text),
            "cmds.item.cache" => writeln!(out, "cached: {}", text),
            "result" => {
                result = Some(text == "SUCCEEDED");
                Ok(())
            }
            _ => Ok(()),
        };
        if let Err(err) = written {
            write_err.get_or_insert(err);
        }
    };

    let mut buf = [0u8; 8192];
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        decoder.feed(&buf[..n], &mut handle)?;
    }
    decoder.finish(&mut handle)?;
    if let Some(err) = write_err {
        return Err(err.into());
    }
    match result {
        Some(success) => Ok(success),
        None => anyhow::bail!("progress stream ended without a result"),
    }
}

fn run_build(port: u16, stream_port: u16, args: BuildArgs) -> anyhow::Result<i32> {
    let mut client = Client::connect(("127.0.0.1", port))?;
    let started = client.call(&Request::StartBuild {
        targets: args.targets,
        num_threads: args.jobs,
    })?;
    if started != Value::from(0) {
        eprintln!("falcon: a build is already running");
        return Ok(1);
    }
    let stream = TcpStream::connect(("127.0.0.1", stream_port))?;
    let success = report_stream(stream, &mut std::io::stdout().lock())?;
    if !success {
        eprintln!("falcon: build failed");
    }
    Ok(if success { 0 } else { 1 })
}

fn query(port: u16, request: Request) -> anyhow::Result<i32> {
    let value = Client::connect(("127.0.0.1", port))?.call(&request)?;
    match value {
        Value::Null => {}
        Value::String(s) => println!("{}", s),
        v => println!("{}", serde_json::to_string_pretty(&v)?),
    }
    Ok(0)
}

fn run_impl() -> anyhow::Result<i32> {
    let args: Args = argh::from_env();
    let (port, stream_port) = (args.port, args.stream_port);
    let request = match args.command {
        Command::Daemon(daemon) => return run_daemon(daemon),
        Command::Build(build) => {
            init_logging("warn");
            return run_build(port, stream_port, build);
        }
        Command::Interrupt(_) => Request::InterruptBuild,
        Command::Stop(_) => Request::Shutdown,
        Command::Status(_) => Request::GetStatus,
        Command::Pid(_) => Request::GetPid,
        Command::DirtySources(_) => Request::GetDirtySources,
        Command::DirtyTargets(_) => Request::GetDirtyTargets,
        Command::InputsOf(a) => Request::GetInputsOf { target: a.target },
        Command::OutputsOf(a) => Request::GetOutputsOf { target: a.target },
        Command::HashOf(a) => Request::GetHashOf { target: a.target },
        Command::SetDirty(a) => Request::SetDirty { target: a.target },
        Command::Graphviz(_) => Request::GetGraphviz,
    };
    init_logging("warn");
    query(port, request)
}

pub fn run() -> anyhow::Result<i32> {
    let res = run_impl();
    trace::close()?;
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_progress() -> anyhow::Result<()> {
        let doc = br#"{"id":0,"cmds":[{"id":0,"cmd":"cat a > b","stdout":"hi\n","stderr":""},{"cache":"c"}],"result":"SUCCEEDED"}"#;
        let mut out = Vec::new();
        assert!(report_stream(&doc[..], &mut out)?);
        assert_eq!(String::from_utf8(out)?, "cat a > b\nhi\ncached: c\n");

        let doc = br#"{"id":1,"cmds":[],"result":"FAILED"}"#;
        assert!(!report_stream(&doc[..], &mut Vec::new())?);

        assert!(report_stream(&br#"{"id":1,"cmds":["#[..], &mut Vec::new()).is_err());
        Ok(())
    }

    #[test]
    fn daemon_flags_override_config() -> anyhow::Result<()> {
        let args = DaemonArgs::from_args(
            &["daemon"],
            &["-C", "/ws", "--api-port", "9000", "-j", "3", "--no-watch"],
        )
        .map_err(|e| anyhow::anyhow!("{}", e.output))?;
        let config = daemon_config(&args)?;
        assert_eq!(config.working_directory, PathBuf::from("/ws"));
        assert_eq!(config.api_port, 9000);
        assert_eq!(config.stream_port, 4343);
        assert_eq!(config.jobs, 3);
        assert!(!config.watch);
        Ok(())
    }
}
