//! Application definition.

extern crate simplelog;

use std::path::Path;

use anyhow::{Error, Result};
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;

use spindle::resource::RESOURCE_TYPES;
use spindle::{ResourceType, Value};
use spindle_net::{Client, Procedure, Server};

use crate::settings::Settings;

pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");
pub const AUTHORS: &'static str = env!("CARGO_PKG_AUTHORS");

pub fn app<'a, 'b>() -> App<'a, 'b> {
    App::new("spindle")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .version(VERSION)
        .author(AUTHORS)
        .about("Run spindle servers and manage the resources they offer.")
        .arg(Arg::with_name("verbosity")
            .long("verbosity")
            .short("v")
            .takes_value(true)
            .default_value("info")
            .value_name("verb")
            .global(true)
            .help("Set the verbosity of the log output"))
        .arg(Arg::with_name("config")
            .long("config")
            .short("c")
            .takes_value(true)
            .value_name("path")
            .global(true)
            .help("Path to the settings file (defaults to ./spindle.toml if present)"))
        .arg(Arg::with_name("secret")
            .long("secret")
            .short("s")
            .takes_value(true)
            .value_name("secret")
            .global(true)
            .help("Shared secret used for authentication, overrides SPINDLE_SECRET"))

        // open subcommand
        .subcommand(SubCommand::with_name("open")
            .display_order(10)
            .about("Start a server")
            .long_about("Start a server\n\n\
            NOTE: the shared secret only authenticates peers, data sent between \n\
            clients and servers is not encrypted.")
            .arg(Arg::with_name("cpu")
                .value_name("cpu-count")
                .help("Number of cpu units to offer (defaults to the number of cores)"))
            .arg(Arg::with_name("gpu")
                .value_name("gpu-count")
                .help("Number of gpu units to offer (defaults to zero)"))
            .arg(Arg::with_name("port")
                .value_name("port")
                .help("Port to listen on")))

        // close subcommand
        .subcommand(SubCommand::with_name("close")
            .display_order(11)
            .about("Shut down servers (defaults to the local one)")
            .arg(Arg::with_name("machines")
                .multiple(true)
                .value_name("host[:port]")))

        // get subcommand
        .subcommand(SubCommand::with_name("get")
            .display_order(20)
            .about("Show idle resources of a server")
            .arg(Arg::with_name("machine")
                .required(true)
                .value_name("host[:port]"))
            .arg(Arg::with_name("all")
                .possible_values(&["all"])
                .help("Show the full allocation table instead")))

        // request subcommand
        .subcommand(SubCommand::with_name("request")
            .display_order(21)
            .about("Claim resource units on a server")
            .arg(Arg::with_name("machine")
                .required(true)
                .value_name("host[:port]"))
            .arg(Arg::with_name("units")
                .required(true)
                .value_name("count|all"))
            .arg(Arg::with_name("type")
                .required(true)
                .possible_values(&["cpu", "gpu"])
                .value_name("type")))

        // set subcommand
        .subcommand(SubCommand::with_name("set")
            .display_order(22)
            .about("Change the total units offered by the local server")
            .arg(Arg::with_name("units")
                .required(true)
                .value_name("count"))
            .arg(Arg::with_name("type")
                .required(true)
                .possible_values(&["cpu", "gpu"])
                .value_name("type"))
            .arg(Arg::with_name("machine")
                .long("machine")
                .short("m")
                .takes_value(true)
                .value_name("host[:port]")
                .help("Address a server other than the local one")))
}

/// Runs based on specified subcommand.
pub fn start(matches: ArgMatches) -> Result<()> {
    let (name, m) = match matches.subcommand() {
        (name, Some(m)) => (name, m),
        _ => return Ok(()),
    };
    setup_log_verbosity(m);
    let settings = load_settings(m)?;
    match name {
        "open" => start_open(m, settings),
        "close" => start_close(m, &settings),
        "get" => start_get(m, &settings),
        "request" => start_request(m, &settings),
        "set" => start_set(m, &settings),
        _ => Err(Error::msg(format!("unknown subcommand: {}", name))),
    }
}

fn load_settings(matches: &ArgMatches) -> Result<Settings> {
    let mut settings = Settings::load(matches.value_of("config").map(Path::new))?;
    if let Some(secret) = matches.value_of("secret") {
        settings.secret = secret.to_string();
    }
    Ok(settings)
}

/// Starts a server and blocks until it's shut down, either remotely or
/// with ctrl-c.
fn start_open(matches: &ArgMatches, mut settings: Settings) -> Result<()> {
    if let Some(cpu) = matches.value_of("cpu") {
        settings.cpu = Some(cpu.parse()?);
    }
    if let Some(gpu) = matches.value_of("gpu") {
        settings.gpu = Some(gpu.parse()?);
    }
    if let Some(port) = matches.value_of("port") {
        settings.port = port.parse()?;
    }
    if settings.secret.is_empty() {
        warn!("no secret set, anyone who can reach the server can use it");
    }

    let handle = Server::start(settings.server_config()?)?;
    let context = handle.context().clone();
    println!(
        "listening for clients on {} (cpu: {}, gpu: {})",
        handle.address().green(),
        context.pool(ResourceType::Cpu)?.size(),
        context.pool(ResourceType::Gpu)?.size()
    );

    // run a loop allowing graceful shutdown
    ctrlc::set_handler(move || {
        println!("Initiating graceful shutdown...");
        context.shutdown();
    })?;
    handle.join()?;
    println!("server stopped");
    Ok(())
}

fn start_close(matches: &ArgMatches, settings: &Settings) -> Result<()> {
    let machines = match matches.values_of("machines") {
        Some(values) => values
            .map(|s| settings.machine(s))
            .collect::<Result<Vec<_>>>()?,
        None => vec![settings.local_machine()],
    };
    let mut failed = 0;
    for machine in machines {
        let mut client = Client::new(machine.clone(), settings.client_config()?);
        match client.shutdown_server() {
            Ok(()) => println!("{} {}", "closed".green(), machine),
            Err(e) => {
                println!("{} {}: {}", "failed closing".red(), machine, e);
                failed += 1;
            }
        }
    }
    if failed > 0 {
        return Err(Error::msg(format!("failed closing {} server(s)", failed)));
    }
    Ok(())
}

fn start_get(matches: &ArgMatches, settings: &Settings) -> Result<()> {
    let machine = settings.machine(required(matches, "machine")?)?;
    let mut client = Client::new(machine.clone(), settings.client_config()?);

    if matches.is_present("all") {
        for rt in RESOURCE_TYPES.iter() {
            let table = client
                .execute(Procedure::native("get_resource_table").arg(rt.to_str()))?;
            println!("{} on {}:", rt.to_str().bold(), machine);
            let table = table.as_map()?;
            if table.is_empty() {
                println!("    (nothing allocated)");
            }
            for (holder, units) in table {
                println!("    {:<24} {}", holder, units.as_usize()?);
            }
        }
        return Ok(());
    }

    let available = client.execute(Procedure::native("get_available_resources"))?;
    let total = client.execute(Procedure::native("get_total_resources"))?;
    for rt in RESOURCE_TYPES.iter() {
        println!(
            "{}: {} of {} idle",
            rt.to_str().bold(),
            units_of(&available, *rt)?,
            units_of(&total, *rt)?
        );
    }
    Ok(())
}

fn start_request(matches: &ArgMatches, settings: &Settings) -> Result<()> {
    let machine = settings.machine(required(matches, "machine")?)?;
    let rt: ResourceType = required(matches, "type")?.parse()?;
    let mut client = Client::new(machine.clone(), settings.client_config()?);

    let granted = match required(matches, "units")? {
        "all" => client
            .execute(Procedure::native("request_all_resources").arg(rt.to_str()))?
            .as_usize()?,
        units => {
            let units: usize = units.parse()?;
            let granted = client
                .execute(Procedure::native("request_resources").kwd(rt.to_str(), units))?;
            units_of(&granted, rt)?
        }
    };
    println!("granted {} {} unit(s) on {}", granted.to_string().green(), rt, machine);
    Ok(())
}

fn start_set(matches: &ArgMatches, settings: &Settings) -> Result<()> {
    let machine = match matches.value_of("machine") {
        Some(m) => settings.machine(m)?,
        None => settings.local_machine(),
    };
    let rt: ResourceType = required(matches, "type")?.parse()?;
    let units: usize = required(matches, "units")?.parse()?;

    let mut client = Client::new(machine.clone(), settings.client_config()?);
    client.execute(
        Procedure::native("set_total_resources")
            .arg(rt.to_str())
            .arg(units),
    )?;
    println!("{} now offers {} {} unit(s)", machine, units, rt);
    Ok(())
}

fn required<'a>(matches: &'a ArgMatches, name: &str) -> Result<&'a str> {
    matches
        .value_of(name)
        .ok_or_else(|| Error::msg(format!("missing argument: {}", name)))
}

fn units_of(map: &Value, rt: ResourceType) -> Result<usize> {
    match map.get(rt.to_str()) {
        Some(v) => Ok(v.as_usize()?),
        None => Ok(0),
    }
}

fn setup_log_verbosity(matches: &ArgMatches) {
    use self::simplelog::{LevelFilter, TermLogger};
    let level_filter = match matches.value_of("verbosity") {
        Some(s) => match s {
            "0" | "none" => LevelFilter::Off,
            "1" | "err" | "error" | "min" => LevelFilter::Error,
            "2" | "warn" | "warning" | "default" => LevelFilter::Warn,
            "3" | "info" => LevelFilter::Info,
            "4" | "debug" => LevelFilter::Debug,
            "5" | "trace" | "max" | "all" => LevelFilter::Trace,
            _ => LevelFilter::Warn,
        },
        _ => LevelFilter::Warn,
    };
    let mut config_builder = simplelog::ConfigBuilder::new();
    let logger_conf = config_builder
        .set_time_level(LevelFilter::Error)
        .set_target_level(LevelFilter::Debug)
        .set_location_level(LevelFilter::Trace)
        .set_time_format_str("%H:%M:%S%.6f")
        .build();
    let _ = TermLogger::init(level_filter, logger_conf, simplelog::TerminalMode::Mixed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subcommands() {
        let matches = app()
            .get_matches_from_safe(vec!["spindle", "request", "10.0.0.1:3000", "all", "gpu"])
            .unwrap();
        let (name, m) = matches.subcommand();
        assert_eq!(name, "request");
        let m = m.unwrap();
        assert_eq!(m.value_of("units"), Some("all"));
        assert_eq!(m.value_of("verbosity"), Some("info"));

        assert!(app()
            .get_matches_from_safe(vec!["spindle", "set", "4", "tpu"])
            .is_err());

        let matches = app()
            .get_matches_from_safe(vec!["spindle", "close", "a:1", "b:2", "-s", "xyz"])
            .unwrap();
        let m = matches.subcommand_matches("close").unwrap();
        assert_eq!(m.values_of("machines").unwrap().count(), 2);
        assert_eq!(m.value_of("secret"), Some("xyz"));
    }
}
