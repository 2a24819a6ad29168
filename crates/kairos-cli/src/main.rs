//! Talks to the `/__lb_admin__/` control surface (see
//! `kairos_rs::routes::admin`) over HTTP: list backends, dump metrics,
//! and trigger an out-of-band health check for one service identity.

use clap::{Arg, Command};
use std::process;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("gateway returned {status} for {url}: {body}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
        body: String,
    },
}

fn url_arg() -> Arg {
    Arg::new("url")
        .short('u')
        .long("url")
        .value_name("URL")
        .help("Gateway base URL")
        .default_value("http://localhost:8080")
}

fn identity_arg() -> Arg {
    Arg::new("identity")
        .short('i')
        .long("identity")
        .value_name("IDENTITY")
        .help("Service identity (hostname) to target")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let matches = Command::new("kairos-lb")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Admin CLI for the load balancer's __lb_admin__ surface")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("backends")
                .about("List every pool's backends with live health and metrics")
                .arg(url_arg())
                .arg(identity_arg().required(true)),
        )
        .subcommand(
            Command::new("metrics")
                .about("Dump counters for one service, or every service if --identity is omitted")
                .arg(url_arg())
                .arg(identity_arg()),
        )
        .subcommand(
            Command::new("health-check")
                .about("Force one active-probe cycle outside its scheduled interval")
                .arg(url_arg())
                .arg(identity_arg().required(true)),
        )
        .get_matches();

    let client = reqwest::Client::new();

    let result = match matches.subcommand() {
        Some(("backends", sub)) => {
            let url = sub.get_one::<String>("url").unwrap();
            let identity = sub.get_one::<String>("identity").unwrap();
            get_json(&client, &format!("{url}/__lb_admin__/{identity}/backends")).await
        }
        Some(("metrics", sub)) => {
            let url = sub.get_one::<String>("url").unwrap();
            let endpoint = match sub.get_one::<String>("identity") {
                Some(identity) => format!("{url}/__lb_admin__/{identity}/metrics"),
                None => format!("{url}/__lb_admin__/metrics"),
            };
            get_json(&client, &endpoint).await
        }
        Some(("health-check", sub)) => {
            let url = sub.get_one::<String>("url").unwrap();
            let identity = sub.get_one::<String>("identity").unwrap();
            post_json(&client, &format!("{url}/__lb_admin__/{identity}/health-check")).await
        }
        _ => unreachable!("subcommand_required enforces one of the above"),
    };

    match result {
        Ok(body) => {
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(())
        }
        Err(err) => {
            eprintln!("error: {err}");
            process::exit(1);
        }
    }
}

async fn get_json(client: &reqwest::Client, url: &str) -> Result<serde_json::Value, CliError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|source| CliError::Request { url: url.to_string(), source })?;
    parse_response(url, response).await
}

async fn post_json(client: &reqwest::Client, url: &str) -> Result<serde_json::Value, CliError> {
    let response = client
        .post(url)
        .send()
        .await
        .map_err(|source| CliError::Request { url: url.to_string(), source })?;
    parse_response(url, response).await
}

async fn parse_response(url: &str, response: reqwest::Response) -> Result<serde_json::Value, CliError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|source| CliError::Request { url: url.to_string(), source })?;
    if !status.is_success() {
        return Err(CliError::Status { url: url.to_string(), status, body });
    }
    serde_json::from_str(&body).map_err(|_| CliError::Status { url: url.to_string(), status, body })
}
