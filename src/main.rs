mod cli;

use chrono::Utc;
use controller::config;
use controller::domain::ports::Store;
use controller::domain::reconciler::ControlReconciler;
use controller::inbound::server::{AppState, create_app};
use controller::outbound::sqlite::SqliteStore;
use env_logger::Env;
use log::{error, info};
use std::error::Error;
use std::time::Duration;
use stevedore_shared::{Container, ContainerAccepted, ContainerState, Node, PortMapping, short_id};
use tokio::net::TcpListener;
use tokio::sync::watch;
use worker::client::{ControlApi, HttpApiClient};
use worker::reconciler::WorkerReconciler;
use worker::runtime::DockerRuntime;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    match cli::parse() {
        cli::Cli::StartControl { addr } => start_control(addr).await,
        cli::Cli::StartWorker { control_url } => start_worker(control_url).await,
        cli::Cli::Add {
            image,
            ports,
            control_url,
        } => add_container(image, ports, control_url).await,
        cli::Cli::List { control_url } => list_containers(control_url).await,
        cli::Cli::Nodes { control_url } => list_nodes(control_url).await,
        cli::Cli::Delete { id, control_url } => mark_destroyed(id, control_url).await,
        cli::Cli::Clean { control_url } => clean(control_url).await,
    }
}

async fn start_control(addr: Option<String>) -> Result<(), Box<dyn Error>> {
    let config = config::get_config();
    let addr = normalize_addr(addr.unwrap_or_else(|| config.listen_addr.clone()));
    let store = SqliteStore::connect(&config.database_path).await?;

    let app = create_app(AppState {
        store: store.clone(),
    });
    let listener = TcpListener::bind(&addr).await?;
    info!("Control plane listening on http://{addr}");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("API server error: {e}");
        }
    });

    info!(
        "Starting reconciliation loop, interval {}s",
        config.reconcile_interval_secs
    );
    let reconciler = ControlReconciler::new(
        store.clone(),
        Duration::from_secs(config.reconcile_interval_secs),
        Duration::from_secs(config.node_stale_secs),
    );
    reconciler.run(shutdown_signal()).await;

    store.close().await;
    Ok(())
}

async fn start_worker(control_url: String) -> Result<(), Box<dyn Error>> {
    let node_id = short_id("worker");
    let runtime = DockerRuntime::connect()?;
    let api = HttpApiClient::new(control_url, node_id.clone())?;

    let node = worker::self_node(&node_id);
    api.register(&node).await?;
    info!("Registered node {} at {}", node.id, node.address);

    let shutdown = shutdown_signal();
    tokio::spawn(worker::heartbeat::run(
        api.clone(),
        worker::HEARTBEAT_INTERVAL,
        shutdown.clone(),
    ));

    info!(
        "Starting worker reconciliation loop, interval {}s",
        worker::RECONCILE_INTERVAL.as_secs()
    );
    let reconciler = WorkerReconciler::new(runtime, api, node_id, worker::RECONCILE_INTERVAL);
    reconciler.run(shutdown).await;
    Ok(())
}

/// `":8080"` is accepted as shorthand for every interface.
fn normalize_addr(addr: String) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr
    }
}

fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received shutdown signal, stopping at the next tick");
        let _ = tx.send(true);
    });
    rx
}

fn http_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
}

fn base(url: &str) -> &str {
    url.trim_end_matches('/')
}

async fn add_container(
    image: String,
    ports: Vec<String>,
    control_url: String,
) -> Result<(), Box<dyn Error>> {
    let mut mappings = Vec::new();
    for spec in &ports {
        mappings.push(spec.parse::<PortMapping>()?);
    }
    let container = Container::new(image, mappings);

    let response = http_client()?
        .post(format!("{}/containers", base(&control_url)))
        .json(&container)
        .send()
        .await?
        .error_for_status()?;
    let accepted: ContainerAccepted = response.json().await?;

    println!("Added container: {}", accepted.id);
    println!("Image: {}", container.image);
    for mapping in &container.ports {
        println!("Ports: {mapping}");
    }
    Ok(())
}

async fn list_containers(control_url: String) -> Result<(), Box<dyn Error>> {
    let containers: Vec<Container> = http_client()?
        .get(format!("{}/containers", base(&control_url)))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    if containers.is_empty() {
        println!("No containers found");
        return Ok(());
    }

    println!(
        "{:<20} {:<24} {:<10} {:<10} {:<18}",
        "ID", "IMAGE", "STATE", "DESIRED", "NODE"
    );
    println!("{}", "-".repeat(84));
    for c in containers {
        println!(
            "{:<20} {:<24} {:<10} {:<10} {:<18}",
            c.id,
            c.image,
            c.state.to_string(),
            c.desired_state.to_string(),
            c.node_id
        );
    }
    Ok(())
}

async fn list_nodes(control_url: String) -> Result<(), Box<dyn Error>> {
    let nodes: Vec<Node> = http_client()?
        .get(format!("{}/nodes", base(&control_url)))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    if nodes.is_empty() {
        println!("No nodes found");
        return Ok(());
    }

    println!(
        "{:<30} {:<16} {:<14} {:<10} {:<10}",
        "ID", "ADDRESS", "ROLE", "STATE", "LAST-SEEN"
    );
    println!("{}", "-".repeat(82));
    for node in nodes {
        let age = (Utc::now() - node.last_seen).num_seconds().max(0);
        println!(
            "{:<30} {:<16} {:<14} {:<10} {:<10}",
            node.id,
            node.address,
            node.role.to_string(),
            node.state.to_string(),
            format!("{age}s ago")
        );
    }
    Ok(())
}

async fn mark_destroyed(id: String, control_url: String) -> Result<(), Box<dyn Error>> {
    let client = http_client()?;
    let base = base(&control_url);

    let mut container: Container = client
        .get(format!("{base}/containers/{id}"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    container.desired_state = ContainerState::Destroyed;

    client
        .post(format!("{base}/containers"))
        .json(&container)
        .send()
        .await?
        .error_for_status()?;
    println!("Marked container {id} for destruction");
    Ok(())
}

async fn clean(control_url: String) -> Result<(), Box<dyn Error>> {
    let client = http_client()?;
    let base = base(&control_url);

    let containers: Vec<Container> = client
        .get(format!("{base}/containers"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    let mut marked = 0;
    for mut container in containers {
        if container.desired_state == ContainerState::Destroyed {
            continue;
        }
        container.desired_state = ContainerState::Destroyed;
        client
            .post(format!("{base}/containers"))
            .json(&container)
            .send()
            .await?
            .error_for_status()?;
        marked += 1;
    }
    println!("Marked {marked} containers for destruction");
    Ok(())
}
