use std::future::Future;
use std::io;
use std::process::ExitCode;
use std::time::Duration;

use clap::{crate_authors, crate_version, Arg, ArgAction, ArgMatches, Command};
use env_logger::Env;
use tokio::runtime::Runtime;

use gpibtool::app::{App, Request, Response};
use gpibtool::backend;
use gpibtool::config::{BackendKind, Config, CONFIG_ENV};
use gpibtool::output::{error_record, exit_code, Output};
use gpibtool::protocol::{CommandRequest, Error};

const INTERRUPTED: u8 = 130;

fn address_arg() -> Arg {
    Arg::new("address")
        .required(true)
        .help("Resource address, e.g. GPIB0::6::INSTR")
}

fn asrl_arg() -> Arg {
    Arg::new("asrl")
        .long("asrl")
        .action(ArgAction::SetTrue)
        .help("Include serial (ASRL) resources")
}

fn cli() -> Command {
    Command::new("gpibtool")
        .author(crate_authors!())
        .version(crate_version!())
        .about("Discover and talk to GPIB instruments")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Log verbose output"),
        )
        .arg(
            Arg::new("verbose-inf")
                .long("verbose-inf")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Log every message exchanged with the instruments"),
        )
        .arg(
            Arg::new("dict")
                .long("dict")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Print JSON records keyed by address"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .global(true)
                .env(CONFIG_ENV)
                .value_name("PATH")
                .help("Load settings from a TOML file"),
        )
        .arg(
            Arg::new("backend")
                .long("backend")
                .global(true)
                .value_parser(BackendKind::NAMES)
                .help("Driver stack used to reach the instruments"),
        )
        .arg(
            Arg::new("timeout-ms")
                .long("timeout-ms")
                .global(true)
                .value_parser(clap::value_parser!(u64).range(1..))
                .help("Maximum time to wait for a reply"),
        )
        .subcommand(
            Command::new("addresses")
                .visible_alias("list-addresses")
                .about("List the resources visible on the bus")
                .arg(asrl_arg()),
        )
        .subcommand(
            Command::new("idn")
                .about("Query *IDN? of the given instruments")
                .arg(address_arg().num_args(1..)),
        )
        .subcommand(
            Command::new("idns")
                .visible_aliases(["list-idns", "list"])
                .about("Query *IDN? of every instrument on the bus")
                .arg(asrl_arg()),
        )
        .subcommand(
            Command::new("command-query")
                .about("Send a command and print the reply")
                .arg(address_arg())
                .arg(Arg::new("command").required(true)),
        )
        .subcommand(
            Command::new("command-write")
                .about("Send a command without reading a reply")
                .arg(address_arg())
                .arg(Arg::new("command").required(true)),
        )
        .subcommand(Command::new("info").about("Print version, configuration and resources"))
        .subcommand(Command::new("syntax").about("Print address and command grammar"))
}

fn init_logging(matches: &ArgMatches) {
    if matches.get_flag("verbose-inf") {
        env_logger::Builder::from_env(Env::default().default_filter_or("gpibtool=trace")).init();
    } else if matches.get_flag("verbose") {
        env_logger::Builder::from_env(Env::default().default_filter_or("gpibtool=debug")).init();
    } else {
        env_logger::init();
    }
}

fn load_config(matches: &ArgMatches) -> anyhow::Result<Config> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(name) = matches.get_one::<String>("backend") {
        config.backend = name.parse()?;
    }
    if let Some(ms) = matches.get_one::<u64>("timeout-ms") {
        config.timeout = Duration::from_millis(*ms);
    }
    if matches.get_flag("verbose-inf") {
        config.trace_io = true;
    }
    if let Some((_, sub)) = matches.subcommand() {
        if sub.try_get_one::<bool>("asrl").ok().flatten() == Some(&true) {
            config.keep_asrl = true;
        }
    }
    log::debug!("Effective configuration: {:?}", config);
    Ok(config)
}

fn render<W: io::Write>(out: &mut Output<W>, resp: &Response) -> io::Result<()> {
    match resp {
        Response::Addresses(table) => out.addresses(table),
        Response::Idn { addr, idn } => out.value(addr, idn),
        Response::Idns(map) => out.results(map),
        Response::Scpi {
            addr,
            command,
            response,
        } => out.command(addr, command, response),
    }
}

async fn execute(matches: &ArgMatches, config: Config) -> anyhow::Result<()> {
    let dict = matches.get_flag("dict");
    let mut out = Output::new(io::stdout(), dict);
    let (name, sub) = match matches.subcommand() {
        Some(x) => x,
        None => return Ok(()),
    };
    if name == "syntax" {
        out.syntax()?;
        return Ok(());
    }

    let app = App::new(backend::connect(&config)?, &config);
    let requests = match name {
        "addresses" => vec![Request::ListAddresses],
        "idns" => vec![Request::ListIdns],
        "idn" => sub
            .get_many::<String>("address")
            .into_iter()
            .flatten()
            .map(|addr| Request::Idn(addr.clone()))
            .collect(),
        "command-query" | "command-write" => {
            let addr = sub.get_one::<String>("address").cloned().unwrap_or_default();
            let command = sub.get_one::<String>("command").cloned().unwrap_or_default();
            let task = if name == "command-query" {
                CommandRequest::query(command)
            } else {
                CommandRequest::write(command)
            };
            vec![Request::Scpi { addr, task }]
        }
        "info" => {
            let resources = app.list_addresses().await;
            out.info(app.backend_name(), &config, &resources)?;
            return Ok(());
        }
        _ => return Err(anyhow::anyhow!("unknown command `{}`", name)),
    };
    // the first failure aborts, results printed so far stay printed
    for req in requests {
        let resp = app.handle_request(req).await?;
        render(&mut out, &resp)?;
    }
    Ok(())
}

fn report(err: &anyhow::Error, dict: bool) -> ExitCode {
    match err.downcast_ref::<Error>() {
        Some(err) => {
            if dict {
                println!("{}", serde_json::json!({ "error": error_record(err) }));
            }
            eprintln!("Error: {}", err);
            ExitCode::from(exit_code(err))
        }
        None => {
            eprintln!("Error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

/// Run `request` unless `interrupt` fires first. An interrupt source that
/// fails to register is ignored.
async fn interruptible<F, I>(request: F, interrupt: I, dict: bool) -> ExitCode
where
    F: Future<Output = anyhow::Result<()>>,
    I: Future<Output = io::Result<()>>,
{
    tokio::select! {
        ret = request => match ret {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => report(&err, dict),
        },
        Ok(()) = interrupt => {
            log::debug!("Interrupted, closing open sessions");
            ExitCode::from(INTERRUPTED)
        }
    }
}

fn main() -> ExitCode {
    let matches = cli().get_matches();
    init_logging(&matches);
    let dict = matches.get_flag("dict");

    let config = match load_config(&matches) {
        Ok(config) => config,
        Err(err) => return report(&err, dict),
    };

    let rt = match Runtime::new() {
        Ok(rt) => rt,
        Err(err) => return report(&err.into(), dict),
    };
    rt.block_on(interruptible(
        execute(&matches, config),
        tokio::signal::ctrl_c(),
        dict,
    ))
}
