mod control;
mod host;
mod logger;
mod radio;
mod runtime;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process;

use anyhow::Context;
use crossbeam_channel as chan;

use crate::host::NullHost;
use crate::radio::UdpRadio;
use crate::runtime::{Paths, Runtime};

pub const NAME: &str = "shelfosd";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const HELP_MSG: &str = r#"
Usage

   shelfosd [<option>...]

Options

    --home                <path>    Directory for config.json, registry.json and the control socket
    --label               <name>    Display label for this node (used only on first run)
    --bind                <addr>    Local UDP address to bind the radio to (default 0.0.0.0:8717)
    --broadcast           <addr>    UDP broadcast address to send on (default 255.255.255.255:8717)
    --version                       Print program version
    --help                          Print help
"#;

#[derive(Debug)]
struct Options {
    home: PathBuf,
    label: String,
    bind: SocketAddr,
    broadcast: SocketAddr,
}

impl Options {
    fn from_env() -> Result<Self, anyhow::Error> {
        use lexopt::prelude::*;

        let mut parser = lexopt::Parser::from_env();
        let mut home = default_home();
        let mut label = whoami_label();
        let mut bind: SocketAddr = (Ipv4Addr::UNSPECIFIED, 8717).into();
        let mut broadcast: SocketAddr = (Ipv4Addr::BROADCAST, 8717).into();

        while let Some(arg) = parser.next()? {
            match arg {
                Long("home") => home = PathBuf::from(parser.value()?),
                Long("label") => {
                    label = parser
                        .value()?
                        .into_string()
                        .map_err(|_| anyhow::anyhow!("--label must be valid UTF-8"))?
                }
                Long("bind") => bind = parse_addr(&parser.value()?, "--bind")?,
                Long("broadcast") => broadcast = parse_addr(&parser.value()?, "--broadcast")?,
                Long("help") | Short('h') => {
                    println!("{HELP_MSG}");
                    process::exit(0);
                }
                Long("version") => {
                    println!("{NAME} {VERSION}");
                    process::exit(0);
                }
                _ => anyhow::bail!(arg.unexpected()),
            }
        }

        Ok(Self {
            home,
            label,
            bind,
            broadcast,
        })
    }
}

fn parse_addr(value: &std::ffi::OsStr, flag: &str) -> anyhow::Result<SocketAddr> {
    value
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("{flag} must be valid UTF-8"))?
        .parse()
        .with_context(|| format!("{flag} is not a valid address"))
}

fn default_home() -> PathBuf {
    std::env::var_os("SHELFOS_HOME")
        .map(PathBuf::from)
        .or_else(|| dirs_next_home().map(|h| h.join(".shelfos")))
        .unwrap_or_else(|| PathBuf::from(".shelfos"))
}

fn dirs_next_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

fn whoami_label() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "shelfos-node".into())
}

fn execute() -> anyhow::Result<()> {
    let level = logger::env_level().unwrap_or(log::Level::Info);
    logger::init(level)?;

    let options = Options::from_env()?;
    std::fs::create_dir_all(&options.home)
        .with_context(|| format!("couldn't create {}", options.home.display()))?;

    log::info!(target: "node", "Starting {NAME} {VERSION}");
    log::info!(target: "node", "Home directory: {}", options.home.display());

    let paths = Paths {
        config: options.home.join("config.json"),
        registry: options.home.join("registry.json"),
    };
    let socket_path = options.home.join("control.sock");

    let radio = UdpRadio::bind(options.bind, options.broadcast)
        .with_context(|| format!("couldn't bind radio to {}", options.bind))?;
    log::info!(target: "radio", "Bound to {}, broadcasting to {}", options.bind, options.broadcast);

    let (tx, rx) = chan::unbounded();
    let control_socket_path = socket_path.clone();
    std::thread::spawn(move || {
        if let Err(e) = control::listen(&control_socket_path, tx) {
            log::error!(target: "control", "Control socket exited: {e}");
        }
    });

    let runtime = Runtime::init(paths, &options.label, Box::new(NullHost), Box::new(radio), rx)
        .context("failed to initialize runtime")?;

    runtime.run().context("runtime loop exited")?;
    Ok(())
}

fn main() {
    if let Err(err) = execute() {
        log::error!(target: "node", "Fatal: {err:#}");
        process::exit(1);
    }
}
