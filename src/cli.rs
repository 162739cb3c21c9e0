use clap::{Arg, ArgMatches, Command};
use std::env;

#[derive(Debug)]
pub enum Cli {
    StartControl {
        addr: Option<String>,
    },
    StartWorker {
        control_url: String,
    },
    Add {
        image: String,
        ports: Vec<String>,
        control_url: String,
    },
    List {
        control_url: String,
    },
    Nodes {
        control_url: String,
    },
    Delete {
        id: String,
        control_url: String,
    },
    Clean {
        control_url: String,
    },
}

fn control_url_arg() -> Arg {
    let default =
        env::var("STEVEDORE_CONTROL_URL").unwrap_or_else(|_| "http://localhost:8080".to_string());
    Arg::new("control_url")
        .long("control-url")
        .value_name("URL")
        .help("Base URL of the control plane")
        .default_value(clap::builder::Str::from(default))
}

pub fn parse() -> Cli {
    let matches = Command::new("stevedore")
        .version("0.1.0")
        .about("declarative container orchestration across a pool of workers")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("start-control")
                .about("Run the control plane and its reconciler")
                .arg(
                    Arg::new("addr")
                        .value_name("ADDR")
                        .help("Listen address, e.g. :8080 or 0.0.0.0:8080"),
                ),
        )
        .subcommand(
            Command::new("start-worker")
                .about("Register with a control plane and run the worker reconciler")
                .arg(
                    Arg::new("control_url")
                        .value_name("CONTROL_URL")
                        .required(true),
                ),
        )
        .subcommand(
            Command::new("add")
                .about("Request a container")
                .arg(Arg::new("image").value_name("IMAGE").required(true))
                .arg(
                    Arg::new("ports")
                        .value_name("HOST:CONTAINER")
                        .num_args(0..)
                        .help("Port forwardings, e.g. 8081:80 or 5353:53/udp"),
                )
                .arg(control_url_arg()),
        )
        .subcommand(
            Command::new("list")
                .alias("ls")
                .about("List containers")
                .arg(control_url_arg()),
        )
        .subcommand(
            Command::new("nodes")
                .about("List nodes")
                .arg(control_url_arg()),
        )
        .subcommand(
            Command::new("delete")
                .alias("rm")
                .about("Mark a container for destruction")
                .arg(Arg::new("id").value_name("ID").required(true))
                .arg(control_url_arg()),
        )
        .subcommand(
            Command::new("clean")
                .about("Mark every container for destruction")
                .arg(control_url_arg()),
        )
        .get_matches();
    matches.into()
}

fn control_url(matches: &ArgMatches) -> String {
    matches
        .get_one::<String>("control_url")
        .cloned()
        .unwrap_or_else(|| "http://localhost:8080".to_string())
}

impl From<ArgMatches> for Cli {
    fn from(matches: ArgMatches) -> Self {
        match matches.subcommand() {
            Some(("start-control", sub)) => Cli::StartControl {
                addr: sub.get_one::<String>("addr").cloned(),
            },
            Some(("start-worker", sub)) => Cli::StartWorker {
                control_url: control_url(sub),
            },
            Some(("add", sub)) => Cli::Add {
                image: sub.get_one::<String>("image").cloned().unwrap_or_default(),
                ports: sub
                    .get_many::<String>("ports")
                    .map(|values| values.cloned().collect())
                    .unwrap_or_default(),
                control_url: control_url(sub),
            },
            Some(("list", sub)) => Cli::List {
                control_url: control_url(sub),
            },
            Some(("nodes", sub)) => Cli::Nodes {
                control_url: control_url(sub),
            },
            Some(("delete", sub)) => Cli::Delete {
                id: sub.get_one::<String>("id").cloned().unwrap_or_default(),
                control_url: control_url(sub),
            },
            Some(("clean", sub)) => Cli::Clean {
                control_url: control_url(sub),
            },
            _ => unreachable!("subcommand is required"),
        }
    }
}
