use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::{Mutex, mpsc},
    task::JoinHandle,
    time::{sleep, timeout},
};

use cra_worker::{
    config::{Config, Log},
    worker_main,
};
use runtime::{
    Vertex,
    endpoints::{AsyncInputEndpoint, AsyncOutputEndpoint, EndpointRegistrar},
    registry::VertexRegistry,
};
use sdk::{ConnectionInitiator, CraClient};
use store::naming::shard_name;

/// A vertex with one async input `in` and one async output `out`; every
/// byte arriving on the input comes back out of the output.
struct EchoVertex {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>>,
}

#[async_trait]
impl Vertex for EchoVertex {
    async fn initialize(
        &self,
        registrar: &EndpointRegistrar,
        _params: &[u8],
    ) -> Result<(), runtime::Error> {
        registrar
            .add_async_input("in", Arc::new(EchoInput { tx: self.tx.clone() }))
            .await?;
        registrar
            .add_async_output("out", Arc::new(EchoOutput { rx: self.rx.clone() }))
            .await?;
        Ok(())
    }
}

struct EchoInput {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

#[async_trait]
impl AsyncInputEndpoint for EchoInput {
    async fn run(&self, mut stream: TcpStream) {
        let mut buf = [0u8; 2048];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(size) => {
                    if self.tx.send(buf[..size].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    }
}

struct EchoOutput {
    rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>>,
}

#[async_trait]
impl AsyncOutputEndpoint for EchoOutput {
    async fn run(&self, mut stream: TcpStream) {
        let Some(mut rx) = self.rx.lock().await.take() else {
            return;
        };

        while let Some(chunk) = rx.recv().await {
            if stream.write_all(&chunk).await.is_err() {
                break;
            }
        }
    }
}

fn register_echo_factory() {
    VertexRegistry::global().register(
        "echo",
        Arc::new(|_shard| {
            let (tx, rx) = mpsc::unbounded_channel();
            let vertex: Arc<dyn Vertex> = Arc::new(EchoVertex {
                tx,
                rx: Arc::new(Mutex::new(Some(rx))),
            });
            vertex
        }),
    );
}

fn worker_config(namespace: &str, instance: &str, port: u16) -> Config {
    Config {
        instance: instance.to_string(),
        port,
        address: "127.0.0.1".to_string(),
        storage: format!("mem://{}", namespace),
        log: Log::default(),
    }
}

fn start_worker(namespace: &str, instance: &str, port: u16) -> JoinHandle<()> {
    let config = worker_config(namespace, instance, port);
    tokio::spawn(async move {
        if let Err(e) = worker_main(config).await {
            eprintln!("worker exited: {}", e);
        }
    })
}

async fn open_client(namespace: &str) -> Result<CraClient> {
    Ok(CraClient::open(&format!("mem://{}", namespace)).await?)
}

async fn setup_echo_pair(
    namespace: &str,
    port_a: u16,
    port_b: u16,
) -> Result<(CraClient, JoinHandle<()>, JoinHandle<()>)> {
    register_echo_factory();

    let worker_a = start_worker(namespace, "worker-a", port_a);
    let worker_b = start_worker(namespace, "worker-b", port_b);
    sleep(Duration::from_millis(500)).await;

    let client = open_client(namespace).await?;
    assert!(client.define_vertex("echo", b"echo", false).await.is_success());
    assert!(
        client
            .instantiate_vertex("worker-a", "ea", "echo", b"")
            .await
            .is_success()
    );
    assert!(
        client
            .instantiate_vertex("worker-b", "eb", "echo", b"")
            .await
            .is_success()
    );

    Ok((client, worker_a, worker_b))
}

#[tokio::test]
async fn test_point_to_point_echo() -> Result<()> {
    let (client, _a, _b) = setup_echo_pair("p2p", 21110, 21111).await?;

    assert!(client.connect("ea", "out", "eb", "in").await.is_success());

    let probe = client.register_as_vertex("probe").await?;
    probe.add_output("po", true).await?;
    probe.add_input("pi", true).await?;

    let tx_stream = probe
        .open_output_stream("po", "ea", "in")
        .await
        .expect("output stream");
    let rx_stream = probe
        .open_input_stream("eb", "out", "pi")
        .await
        .expect("input stream");

    tx_stream.write_all(b"through the fabric").await?;

    let mut buf = [0u8; 18];
    timeout(Duration::from_secs(5), rx_stream.read_exact(&mut buf)).await??;
    assert_eq!(&buf, b"through the fabric");

    probe.dispose().await;
    Ok(())
}

#[tokio::test]
async fn test_reverse_connect() -> Result<()> {
    let (client, _a, _b) = setup_echo_pair("reverse", 21120, 21121).await?;

    // The destination side dials; data still flows ea.out -> eb.in.
    assert!(
        client
            .connect_with_initiator("ea", "out", "eb", "in", ConnectionInitiator::ToSide)
            .await
            .is_success()
    );

    let probe = client.register_as_vertex("probe").await?;
    probe.add_output("po", true).await?;
    probe.add_input("pi", true).await?;

    let tx_stream = probe.open_output_stream("po", "ea", "in").await.expect("output");
    let rx_stream = probe.open_input_stream("eb", "out", "pi").await.expect("input");

    tx_stream.write_all(b"backwards dial").await?;

    let mut buf = [0u8; 14];
    timeout(Duration::from_secs(5), rx_stream.read_exact(&mut buf)).await??;
    assert_eq!(&buf, b"backwards dial");

    probe.dispose().await;
    Ok(())
}

#[tokio::test]
async fn test_worker_restart_reestablishes_connection() -> Result<()> {
    let (client, worker_a, _b) = setup_echo_pair("restart", 21130, 21131).await?;

    assert!(client.connect("ea", "out", "eb", "in").await.is_success());

    let probe = client.register_as_vertex("probe").await?;
    probe.add_output("po", true).await?;
    probe.add_input("pi", true).await?;

    let tx_stream = probe.open_output_stream("po", "ea", "in").await.expect("output");
    let rx_stream = probe.open_input_stream("eb", "out", "pi").await.expect("input");

    tx_stream.write_all(b"before").await?;
    let mut buf = [0u8; 6];
    timeout(Duration::from_secs(5), rx_stream.read_exact(&mut buf)).await??;
    assert_eq!(&buf, b"before");

    // Kill worker A and bring it back on the same port. It must rebuild
    // `ea` from the vertex table and re-establish ea.out -> eb.in from the
    // connection table on its own.
    worker_a.abort();
    sleep(Duration::from_millis(200)).await;
    let _worker_a2 = start_worker("restart", "worker-a", 21130);
    sleep(Duration::from_secs(4)).await;

    // Fresh stream into the rebuilt vertex; the read side stays on the
    // untouched worker B.
    let tx_stream = probe.open_output_stream("po", "ea", "in").await.expect("redial");
    tx_stream.write_all(b"after-restart").await?;

    let mut buf = [0u8; 13];
    timeout(Duration::from_secs(10), rx_stream.read_exact(&mut buf)).await??;
    assert_eq!(&buf, b"after-restart");

    probe.dispose().await;
    Ok(())
}

#[tokio::test]
async fn test_full_mesh_creates_f_times_t_rows() -> Result<()> {
    // Pure metadata: no worker is running, every load RPC fails
    // best-effort, and the rows must exist regardless.
    let client = open_client("mesh").await?;
    let instances = vec!["ia".to_string(), "ib".to_string(), "ic".to_string()];

    assert!(client.define_vertex("mesh-src", b"src", true).await.is_success());
    assert!(client.define_vertex("mesh-snk", b"snk", true).await.is_success());

    client
        .instantiate_sharded(&instances, "src", "mesh-src", b"", 1, None)
        .await;
    client
        .instantiate_sharded(&instances[..2].to_vec(), "snk", "mesh-snk", b"", 1, None)
        .await;

    assert_eq!(client.get_sharding_info("src").await?.all_shards.len(), 3);
    assert_eq!(client.get_sharding_info("snk").await?.all_shards.len(), 2);

    client
        .connect_sharded_with_full_mesh("src", &["o0", "o1"], "snk", &["i0", "i1", "i2"])
        .await;

    let meta = client.metadata();
    let mut total = 0;
    for shard in 0..3 {
        total += meta
            .connections
            .connections_from(&shard_name("src", shard))
            .await?
            .len();
    }
    assert_eq!(total, 6);

    // Spot-check the pairing: shard j's endpoint i feeds shard i's
    // endpoint j.
    let rows = meta.connections.connections_from(&shard_name("src", 1)).await?;
    assert!(rows.iter().any(|row| {
        row.from_endpoint == "o0" && row.to_vertex == shard_name("snk", 0) && row.to_endpoint == "i1"
    }));

    Ok(())
}

#[tokio::test]
async fn test_full_mesh_arity_mismatch_creates_no_rows() -> Result<()> {
    let client = open_client("mesh-mismatch").await?;
    let instances = vec!["ia".to_string()];

    assert!(client.define_vertex("mesh-src", b"src", true).await.is_success());
    assert!(client.define_vertex("mesh-snk", b"snk", true).await.is_success());

    client
        .instantiate_sharded(&instances, "src", "mesh-src", b"", 3, None)
        .await;
    client
        .instantiate_sharded(&instances, "snk", "mesh-snk", b"", 3, None)
        .await;

    // Two source endpoints against three destination shards.
    let code = client
        .connect_sharded_with_full_mesh("src", &["o0", "o1"], "snk", &["i0", "i1", "i2"])
        .await;
    assert_eq!(code, codec::ErrorCode::VerticesEndpointsNotMatched);

    let meta = client.metadata();
    for shard in 0..3 {
        assert!(
            meta.connections
                .connections_from(&shard_name("src", shard))
                .await?
                .is_empty()
        );
    }

    Ok(())
}

#[tokio::test]
async fn test_detached_dispose_cleans_everything() -> Result<()> {
    register_echo_factory();

    let _worker = start_worker("detached", "worker-a", 21140);
    sleep(Duration::from_millis(500)).await;

    let client = open_client("detached").await?;
    assert!(client.define_vertex("echo", b"echo", false).await.is_success());
    assert!(
        client
            .instantiate_vertex("worker-a", "ea", "echo", b"")
            .await
            .is_success()
    );

    let probe = client.register_as_vertex("probe").await?;
    let instance = probe.instance().to_string();
    assert_eq!(instance.len(), 16);
    assert!(instance.bytes().all(|byte| byte.is_ascii_lowercase()));

    probe.add_input("pi", true).await?;
    probe.add_output("po", true).await?;

    probe.open_output_stream("po", "ea", "in").await.expect("outbound");
    probe.open_input_stream("ea", "out", "pi").await.expect("inbound");

    let meta = client.metadata();
    assert_eq!(meta.endpoints.all_endpoints_of("probe").await?.len(), 2);
    assert_eq!(meta.connections.connections_from("probe").await?.len(), 1);
    assert_eq!(meta.connections.connections_to("probe").await?.len(), 1);

    probe.dispose().await;

    assert!(meta.vertices.vertex_row(&instance, "probe").await.is_err());
    assert!(meta.vertices.instance_for_name(&instance).await.is_err());
    assert!(meta.endpoints.all_endpoints_of("probe").await?.is_empty());
    assert!(meta.connections.connections_from("probe").await?.is_empty());
    assert!(meta.connections.connections_to("probe").await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_vertex_reload_is_idempotent() -> Result<()> {
    register_echo_factory();

    let _worker = start_worker("reload", "worker-a", 21150);
    sleep(Duration::from_millis(500)).await;

    let client = open_client("reload").await?;
    assert!(client.define_vertex("echo", b"echo", false).await.is_success());

    assert!(
        client
            .instantiate_vertex("worker-a", "ea", "echo", b"")
            .await
            .is_success()
    );
    let meta = client.metadata();
    assert_eq!(meta.endpoints.all_endpoints_of("ea").await?.len(), 2);

    // Loading the same name again disposes the previous instance first;
    // afterwards the persisted shape is unchanged.
    assert!(
        client
            .instantiate_vertex("worker-a", "ea", "echo", b"")
            .await
            .is_success()
    );
    assert_eq!(meta.endpoints.all_endpoints_of("ea").await?.len(), 2);
    assert!(meta.vertices.vertex_row("worker-a", "ea").await.is_ok());

    Ok(())
}

#[tokio::test]
async fn test_port_in_use_is_fatal() -> Result<()> {
    let _worker = start_worker("port-clash", "worker-a", 21160);
    sleep(Duration::from_millis(500)).await;

    let result = worker_main(worker_config("port-clash", "worker-b", 21160)).await;
    assert!(result.is_err());

    Ok(())
}

#[tokio::test]
async fn test_unknown_definition_is_rejected() -> Result<()> {
    let _worker = start_worker("undefined", "worker-a", 21170);
    sleep(Duration::from_millis(500)).await;

    let client = open_client("undefined").await?;
    assert_eq!(
        client
            .instantiate_vertex("worker-a", "ghost", "never-defined", b"")
            .await,
        codec::ErrorCode::VertexNotDefined
    );

    Ok(())
}
