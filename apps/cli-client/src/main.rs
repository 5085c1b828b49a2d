use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use client_sdk::{ClientConfig, ConsulClient};
use common::{AclToken, AclTokenType, CheckInfo, CheckOptions, CheckStatus, Event, ServiceOptions};
use serde_json::Value;
use service_proxy::{ConsulRequest, ConsulService};

#[derive(Debug, Parser)]
#[command(name = "consul-cli")]
#[command(about = "Command line client for a Consul agent")]
struct Cli {
    #[arg(long, env = "CONSUL_HOST", default_value = "127.0.0.1")]
    host: String,
    #[arg(long, env = "CONSUL_PORT", default_value_t = 8500)]
    port: u16,
    #[arg(long, env = "CONSUL_HTTP_TOKEN")]
    token: Option<String>,
    #[arg(long, env = "CONSUL_DC")]
    dc: Option<String>,
    /// Route the call through a service proxy instead of calling the client directly.
    #[arg(long)]
    via_proxy: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Put {
        key: String,
        value: String,
    },
    Get {
        key: String,
    },
    List {
        #[arg(default_value = "")]
        prefix: String,
    },
    Delete {
        key: String,
        /// Delete every key under `key` as a prefix.
        #[arg(long)]
        recurse: bool,
    },
    FireEvent {
        name: String,
        #[arg(long, default_value = "")]
        payload: String,
    },
    Events,
    RegisterService {
        name: String,
        #[arg(long)]
        id: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        address: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Attach a TTL check, e.g. `10s`.
        #[arg(long)]
        ttl: Option<String>,
    },
    DeregisterService {
        id: String,
    },
    Services,
    Catalog {
        name: String,
    },
    RegisterCheck {
        name: String,
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        ttl: Option<String>,
        #[arg(long)]
        http: Option<String>,
        #[arg(long)]
        interval: Option<String>,
        #[arg(long)]
        service_id: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    DeregisterCheck {
        id: String,
    },
    Pass {
        id: String,
        #[arg(long)]
        note: Option<String>,
    },
    Warn {
        id: String,
        #[arg(long)]
        note: Option<String>,
    },
    Fail {
        id: String,
        #[arg(long)]
        note: Option<String>,
    },
    UpdateCheck {
        id: String,
        status: CheckStatus,
        #[arg(long, default_value = "")]
        output: String,
    },
    Checks,
    AclCreate {
        #[arg(long, default_value = "")]
        name: String,
        #[arg(long)]
        management: bool,
        #[arg(long, default_value = "")]
        rules: String,
    },
    AclInfo {
        id: String,
    },
    AclList,
    AclDestroy {
        id: String,
    },
}

impl Commands {
    fn into_request(self) -> Result<ConsulRequest> {
        let request = match self {
            Commands::Put { key, value } => ConsulRequest::PutValue { key, value },
            Commands::Get { key } => ConsulRequest::GetValue { key },
            Commands::List { prefix } => ConsulRequest::GetValues { key_prefix: prefix },
            Commands::Delete { key, recurse: true } => ConsulRequest::DeleteValues { key_prefix: key },
            Commands::Delete { key, recurse: false } => ConsulRequest::DeleteValue { key },
            Commands::FireEvent { name, payload } => ConsulRequest::FireEvent {
                event: Event::named(name).with_payload(payload),
            },
            Commands::Events => ConsulRequest::ListEvents {},
            Commands::RegisterService {
                name,
                id,
                tags,
                address,
                port,
                ttl,
            } => {
                let mut service = ServiceOptions::new(name).with_tags(tags);
                service.id = id;
                service.address = address;
                service.port = port;
                service.check_options = ttl.map(CheckOptions::ttl);
                ConsulRequest::RegisterService { service }
            }
            Commands::DeregisterService { id } => ConsulRequest::DeregisterService { id },
            Commands::Services => ConsulRequest::LocalServices {},
            Commands::Catalog { name } => ConsulRequest::InfoService { name },
            Commands::RegisterCheck {
                name,
                id,
                ttl,
                http,
                interval,
                service_id,
                notes,
            } => {
                if ttl.is_none() && (http.is_none() || interval.is_none()) {
                    bail!("a check needs --ttl, or --http together with --interval");
                }
                let check = CheckOptions {
                    id,
                    name: Some(name),
                    service_id,
                    notes,
                    ttl,
                    http,
                    interval,
                    ..CheckOptions::default()
                };
                ConsulRequest::RegisterCheck { check }
            }
            Commands::DeregisterCheck { id } => ConsulRequest::DeregisterCheck { id },
            Commands::Pass { id, note: Some(note) } => ConsulRequest::PassCheckWithNote { id, note },
            Commands::Pass { id, note: None } => ConsulRequest::PassCheck { id },
            Commands::Warn { id, note: Some(note) } => ConsulRequest::WarnCheckWithNote { id, note },
            Commands::Warn { id, note: None } => ConsulRequest::WarnCheck { id },
            Commands::Fail { id, note: Some(note) } => ConsulRequest::FailCheckWithNote { id, note },
            Commands::Fail { id, note: None } => ConsulRequest::FailCheck { id },
            Commands::UpdateCheck { id, status, output } => ConsulRequest::UpdateCheck {
                check: CheckInfo {
                    id,
                    ..CheckInfo::default()
                }
                .with_status(status)
                .with_output(output),
            },
            Commands::Checks => ConsulRequest::LocalChecks {},
            Commands::AclCreate {
                name,
                management,
                rules,
            } => {
                let token_type = if management {
                    AclTokenType::Management
                } else {
                    AclTokenType::Client
                };
                ConsulRequest::CreateAclToken {
                    token: AclToken::named(name)
                        .with_type(token_type)
                        .with_rules(rules),
                }
            }
            Commands::AclInfo { id } => ConsulRequest::InfoAclToken { id },
            Commands::AclList => ConsulRequest::ListAclTokens {},
            Commands::AclDestroy { id } => ConsulRequest::DestroyAclToken { id },
        };
        Ok(request)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string()))
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();
    let mut config = ClientConfig::new(cli.host, cli.port);
    config.acl_token = cli.token;
    config.dc = cli.dc;

    let client = ConsulClient::new(config)?;
    let request = cli.command.into_request()?;

    let result = if cli.via_proxy {
        ConsulService::spawn(client.clone()).call(request).await
    } else {
        ConsulService::new(client.clone()).dispatch(request).await
    };
    client.close();

    print_value(&result?)
}

fn print_value(value: &Value) -> Result<()> {
    match value {
        Value::Null => println!("ok"),
        Value::String(text) => println!("{text}"),
        other => println!("{}", serde_json::to_string_pretty(other)?),
    }
    Ok(())
}
