// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use hvsock::client::HvHttpClient;
use hvsock::common::address::parse_vm_id;
use hvsock::common::{CancellationToken, EndpointAddress};
use hvsock::{Connection, HvSocketServerExt, ListenAddress, ServerOptions};

#[derive(Debug, Parser)] // requires `derive` feature
#[command(name = "hvsock-http")]
#[command(about = "HTTP over Hyper-V sockets", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// GET a path from a Hyper-V socket service and print the body
    Get {
        #[arg(
            long,
            env = "HVSOCK_VM_ID",
            default_value = "parent",
            value_parser = parse_vm_id
        )]
        vm_id: Uuid,

        #[arg(long, env = "HVSOCK_SERVICE_ID")]
        service_id: Uuid,

        #[arg(default_value = "/")]
        path: String,
    },
    /// Serve `GET /` and `POST /echo` on a Hyper-V socket
    Serve {
        #[arg(
            long,
            env = "HVSOCK_VM_ID",
            default_value = "wildcard",
            value_parser = parse_vm_id
        )]
        vm_id: Uuid,

        #[arg(long, env = "HVSOCK_SERVICE_ID")]
        service_id: Uuid,

        #[arg(
            long,
            help = "Additionally listen socket (addr:port, unix path, hvsock:vm.service)"
        )]
        listen: Vec<ListenAddress>,
    },
}

async fn handle(
    endpoint: EndpointAddress,
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    debug!("{} {}", req.method(), req.uri());
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/") => Ok(Response::new(Full::new(Bytes::from(format!(
            "Hello from {endpoint}\n"
        ))))),
        (&Method::POST, "/echo") => {
            let body = req.into_body().collect().await?.to_bytes();
            Ok(Response::new(Full::new(body)))
        }
        _ => {
            let mut response = Response::new(Full::default());
            *response.status_mut() = StatusCode::NOT_FOUND;
            Ok(response)
        }
    }
}

fn serve_connection(endpoint: EndpointAddress, conn: Connection) {
    let peer = conn.peer_addr().clone();
    tokio::spawn(async move {
        let service = service_fn(move |req| handle(endpoint, req));
        let builder = auto::Builder::new(TokioExecutor::new());
        if let Err(err) = builder.serve_connection(TokioIo::new(conn), service).await {
            warn!("Connection from {peer} failed: {err}");
        }
    });
}

async fn serve(endpoint: EndpointAddress, listen: Vec<ListenAddress>) -> anyhow::Result<()> {
    let mut options = ServerOptions::new();
    options.add_hvsock_listener(endpoint.vm_id(), endpoint.service_id());
    for addr in listen {
        options.listen(addr);
    }

    let cancel = CancellationToken::new();
    let mut incoming = options
        .build()
        .bind_all(&cancel)
        .await
        .context("While binding listeners")?;

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
            shutdown.cancel();
        }
    });

    while let Some(conn) = incoming.next().await {
        match conn {
            Ok(conn) => serve_connection(endpoint, conn),
            Err(err) => warn!("Listener failed: {err}"),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hvsock::trace_init()?;

    let cli = Cli::parse();
    debug!("CLI is {:#?}", cli);

    match cli.command {
        Commands::Get {
            vm_id,
            service_id,
            path,
        } => {
            let client = HvHttpClient::new(vm_id, service_id);
            let body = client.get_string(&path).await?;
            print!("{body}");
        }
        Commands::Serve {
            vm_id,
            service_id,
            listen,
        } => serve(EndpointAddress::new(vm_id, service_id), listen).await?,
    }
    Ok(())
}
