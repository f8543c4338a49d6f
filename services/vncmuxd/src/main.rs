mod config;

use crate::config::ProxyConfig;
use argon::logging;
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use conduit::net::registry::{Mapping, MappingStore, RegistryError};
use conduit::net::supervisor::Supervisor;
use std::process;
use std::sync::Arc;

fn store_arg<'a, 'b>() -> Arg<'a, 'b> {
    Arg::with_name("STORE_FILE")
        .long("store")
        .short("s")
        .takes_value(true)
        .help("Path to the mapping store file")
}

pub fn main() {
    let matches = App::new("VNC Proxy")
        .version("0.1.0")
        .author("Bush Hammer Industries")
        .about("Multiplexes one VNC endpoint onto many upstream servers, selected by the client password.")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .subcommand(
            SubCommand::with_name("serve")
                .about("Runs the proxy daemon.")
                .arg(
                    Arg::with_name("CONFIG_FILE")
                        .long("config")
                        .short("c")
                        .takes_value(true)
                        .help("Path to the config file"),
                )
                .arg(
                    Arg::with_name("ADDRESS")
                        .long("address")
                        .short("a")
                        .takes_value(true)
                        .help("Bind address as host:port"),
                )
                .arg(store_arg()),
        )
        .subcommand(
            SubCommand::with_name("add")
                .about("Adds a proxy mapping.")
                .arg(
                    Arg::with_name("KEY")
                        .long("key")
                        .short("k")
                        .required(true)
                        .takes_value(true)
                        .help("Forward key the client authenticates with (1 to 8 bytes)"),
                )
                .arg(
                    Arg::with_name("DEST")
                        .long("dest")
                        .short("d")
                        .required(true)
                        .takes_value(true)
                        .help("Destination VNC server as host:port"),
                )
                .arg(
                    Arg::with_name("DEST_PASSWD")
                        .long("dest-passwd")
                        .short("p")
                        .takes_value(true)
                        .help("Password for destinations that require VNC auth"),
                )
                .arg(store_arg()),
        )
        .subcommand(
            SubCommand::with_name("del")
                .about("Removes proxy mappings by key or by destination.")
                .arg(
                    Arg::with_name("KEY")
                        .long("key")
                        .short("k")
                        .takes_value(true)
                        .help("Forward key of the mapping to remove"),
                )
                .arg(
                    Arg::with_name("DEST")
                        .long("dest")
                        .short("d")
                        .takes_value(true)
                        .help("Destination host or host:port whose mappings to remove"),
                )
                .arg(store_arg()),
        )
        .subcommand(
            SubCommand::with_name("list")
                .about("Lists all proxy mappings.")
                .arg(store_arg()),
        )
        .get_matches();

    match matches.subcommand() {
        ("serve", Some(matches)) => serve(matches),
        ("add", Some(matches)) => add(matches),
        ("del", Some(matches)) => del(matches),
        ("list", Some(matches)) => list(matches),
        _ => unreachable!(),
    }
}

fn serve(matches: &ArgMatches) {
    let config = load_config(matches);
    let log = logging::init();

    let store = match MappingStore::open(&config.store, &log) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            logging::error!(log, "cannot open mapping store";
                            "store" => &config.store, "error" => ?err);
            process::exit(1);
        }
    };

    let supervisor = match Supervisor::new(&config.address, store, &log) {
        Ok(supervisor) => supervisor,
        Err(err) => {
            logging::error!(log, "cannot start the proxy";
                            "address" => &config.address, "error" => ?err);
            process::exit(1);
        }
    };

    supervisor
        .install_signals()
        .expect("Error installing signal handlers");
    supervisor.run();
}

fn load_config(matches: &ArgMatches) -> ProxyConfig {
    let mut config = match matches.value_of("CONFIG_FILE") {
        Some(path) => ProxyConfig::load(path),
        None => ProxyConfig::default(),
    };

    if let Some(address) = matches.value_of("ADDRESS") {
        config.address = address.to_string();
    }
    if let Some(store) = matches.value_of("STORE_FILE") {
        config.store = store.to_string();
    }

    config
}

fn add(matches: &ArgMatches) {
    let store = open_store(matches);

    let mapping = Mapping {
        forward_key: matches.value_of("KEY").expect("KEY is required").to_string(),
        dest_addr: matches.value_of("DEST").expect("DEST is required").to_string(),
        dest_passwd: matches.value_of("DEST_PASSWD").map(str::to_string),
    };

    match store.insert(mapping) {
        Ok(()) => println!("mapping added"),
        Err(RegistryError::DuplicateKey) => fail("a mapping with this key already exists"),
        Err(RegistryError::InvalidName) => fail("the forward key must be 1 to 8 bytes long"),
        Err(RegistryError::Io(err)) => fail(&format!("cannot write store: {}", err)),
    }
}

fn del(matches: &ArgMatches) {
    let store = open_store(matches);

    let result = if let Some(key) = matches.value_of("KEY") {
        store.remove(key)
    } else if let Some(dest) = matches.value_of("DEST") {
        let (host, port) = match dest.rfind(':') {
            Some(idx) => match dest[idx + 1..].parse::<u16>() {
                Ok(port) => (&dest[..idx], Some(port)),
                Err(_) => (dest, None),
            },
            None => (dest, None),
        };
        store.remove_by_dest(host, port)
    } else {
        fail("'del' needs either --key or --dest");
    };

    match result {
        Ok(cnt) => println!("removed {} mapping(s)", cnt),
        Err(err) => fail(&format!("cannot update store: {:?}", err)),
    }
}

fn list(matches: &ArgMatches) {
    let store = open_store(matches);

    let mut mappings = store.snapshot();
    mappings.sort_by(|a, b| a.forward_key.cmp(&b.forward_key));

    for mapping in mappings {
        match mapping.dest_passwd {
            Some(_) => println!("{}\t{}\t(auth)", mapping.forward_key, mapping.dest_addr),
            None => println!("{}\t{}", mapping.forward_key, mapping.dest_addr),
        }
    }
}

fn open_store(matches: &ArgMatches) -> MappingStore {
    let path = matches
        .value_of("STORE_FILE")
        .map(str::to_string)
        .unwrap_or_else(|| ProxyConfig::default().store);

    match MappingStore::open(&path, &logging::discard()) {
        Ok(store) => store,
        Err(err) => fail(&format!("cannot open store '{}': {:?}", path, err)),
    }
}

fn fail(message: &str) -> ! {
    eprintln!("error: {}", message);
    process::exit(1);
}
