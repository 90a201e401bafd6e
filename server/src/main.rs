use clap::Parser;
use log::{error, info, warn};
use rand::Rng;
use server::config::{RpcConfig, ServerConfig};
use server::context::{ProcessContext, ProcessHooks};
use server::push::PushOptions;
use server::rpc::{LocalCluster, RpcGateway};
use server::session::ConnectionEvent;
use server::topology::{StaticTopology, Topology};
use shared::{ServerInfo, Value};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Main-method of the application.
/// Starts a simulated cluster of frontend and backend processes in one runtime,
/// connects fake users and drives a channel through them.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Number of frontend (connector) processes
        #[clap(short, long, default_value = "2")]
        frontends: usize,
        /// Number of backend (area) processes
        #[clap(short, long, default_value = "1")]
        backends: usize,
        /// Fake users to connect
        #[clap(short, long, default_value = "8")]
        users: usize,
        /// Remote call timeout in milliseconds
        #[clap(long, default_value = "5000")]
        rpc_timeout_ms: u64,
        /// Channel the backend creates and pushes to
        #[clap(short, long, default_value = "lobby")]
        channel: String,
        /// First port handed out to simulated servers
        #[clap(short, long, default_value = "3010")]
        port: u16,
    }

    env_logger::init();
    let args = Args::parse();

    if args.frontends == 0 || args.backends == 0 {
        return Err("need at least one frontend and one backend".into());
    }

    // Describe the cluster
    let mut servers = Vec::new();
    for i in 0..args.frontends {
        let port = args.port + i as u16;
        servers.push(ServerInfo::frontend(
            &format!("connector-{}", i + 1),
            "connector",
            "127.0.0.1",
            port,
        ));
    }
    for i in 0..args.backends {
        let port = args.port + (args.frontends + i) as u16;
        servers.push(ServerInfo::backend(
            &format!("area-{}", i + 1),
            "area",
            "127.0.0.1",
            port,
        ));
    }

    let rpc_config = RpcConfig {
        timeout_ms: args.rpc_timeout_ms,
        ..RpcConfig::default()
    };
    let topology: Arc<dyn Topology> = Arc::new(StaticTopology::new(servers.clone()));
    let cluster = Arc::new(LocalCluster::from_config(&rpc_config));

    // Start every process and let it serve its inbound queue
    let mut processes = Vec::new();
    for info in servers {
        let mut config = ServerConfig::new(info);
        config.rpc = rpc_config.clone();
        let rpc: Arc<dyn RpcGateway> = cluster.clone();
        let process = Arc::new(ProcessContext::start(
            config,
            Arc::clone(&topology),
            rpc,
            ProcessHooks::default(),
        ));
        process
            .serve(cluster.register(process.server_id()).await)
            .await;
        processes.push(process);
    }

    let frontends: Vec<Arc<ProcessContext>> = processes
        .iter()
        .filter(|p| p.server().frontend)
        .cloned()
        .collect();
    let backend = processes
        .iter()
        .find(|p| !p.server().frontend)
        .cloned()
        .ok_or("no backend process")?;

    tokio::select! {
        result = run_demo(&args.channel, args.users, &frontends, &backend) => {
            if let Err(e) = result {
                error!("Demo failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    for process in &processes {
        process.stop().await;
    }
    Ok(())
}

/// Connects fake users, binds them, and exercises channel push, broadcast and kick.
async fn run_demo(
    channel_name: &str,
    users: usize,
    frontends: &[Arc<ProcessContext>],
    backend: &Arc<ProcessContext>,
) -> Result<(), Box<dyn std::error::Error>> {
    let backend_sessions = backend
        .backend_sessions()
        .ok_or("backend has no session proxy")?;
    let channels = backend.channels().ok_or("backend has no channels")?;
    let channel = channels.create_channel(channel_name).await?;

    let mut connections = Vec::new();
    for i in 0..users {
        let frontend = &frontends[rand::thread_rng().gen_range(0..frontends.len())];
        let sessions = frontend.sessions().ok_or("frontend has no sessions")?;

        let (tx, rx) = mpsc::unbounded_channel();
        let Some(sid) = sessions.create(tx).await else {
            warn!("{} refused connection {}", frontend.server_id(), i);
            continue;
        };
        let uid = format!("user-{}", i + 1);

        // The backend binds the user the way a login handler would
        let mut session = backend_sessions
            .get(frontend.server_id(), sid)
            .await?
            .ok_or("session vanished")?;
        session.bind(&uid).await?;
        session.set("level", Value::from(1 + i as i64));
        session.push("level").await?;

        channel.add(&uid, frontend.server_id()).await;
        connections.push((uid, frontend.server_id().to_string(), rx));
    }
    info!(
        "{} users in {} across {} frontend(s)",
        channel.len().await,
        channel_name,
        frontends.len()
    );

    let report = channel
        .push_message("onChat", Value::from("welcome"), &PushOptions::default())
        .await?;
    info!(
        "Channel push: {} call(s), {} delivered",
        report.partitions, report.delivered
    );

    let report = channels
        .broadcast(
            "connector",
            "onNotice",
            Value::from("server restart soon"),
            &PushOptions {
                binded: true,
                ..PushOptions::default()
            },
        )
        .await?;
    info!(
        "Broadcast: {} call(s), {} delivered",
        report.partitions, report.delivered
    );

    if let Some((uid, frontend_id, _)) = connections.first() {
        backend_sessions
            .kick_by_uid(frontend_id, uid, Some("demo finished"))
            .await?;
        channel.leave(uid, frontend_id).await;
        info!("Kicked {}", uid);
    }

    for (uid, _, mut rx) in connections {
        let mut pushes = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                ConnectionEvent::Push(_) => pushes += 1,
                ConnectionEvent::Kick { reason } => info!("{} kicked: {}", uid, reason),
                ConnectionEvent::Close => {}
            }
        }
        info!("{} received {} push(es)", uid, pushes);
    }

    Ok(())
}
