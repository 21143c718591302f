use anyhow::Result;

use codec::ErrorCode;
use sdk::CraClient;

#[tokio::test]
async fn test_connect_requires_both_vertices() -> Result<()> {
    let client = CraClient::open("mem://sdk-validate").await?;

    // No rows at all: the validation failure precedes the row insert.
    assert_eq!(
        client.connect("ghost-a", "out", "ghost-b", "in").await,
        ErrorCode::VertexNotFound
    );
    assert!(
        client
            .metadata()
            .connections
            .connections_from("ghost-a")
            .await?
            .is_empty()
    );

    Ok(())
}

#[tokio::test]
async fn test_connect_is_idempotent_and_keeps_row_on_rpc_failure() -> Result<()> {
    let client = CraClient::open("mem://sdk-idempotent").await?;
    let meta = client.metadata();

    // Vertex rows without any live worker: the RPC leg must fail, the
    // durable intent must not.
    meta.vertices.register_vertex("ia", "a", "def", b"").await?;
    meta.vertices.register_vertex("ib", "b", "def", b"").await?;

    let first = client.connect("a", "out", "b", "in").await;
    let second = client.connect("a", "out", "b", "in").await;
    assert!(!first.is_success());
    assert!(!second.is_success());

    assert_eq!(meta.connections.connections_from("a").await?.len(), 1);

    assert!(client.disconnect("a", "out", "b", "in").await.is_success());
    assert!(meta.connections.connections_from("a").await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_instantiate_writes_row_before_rpc() -> Result<()> {
    let client = CraClient::open("mem://sdk-dormant").await?;

    assert!(client.define_vertex("counter", b"counter", false).await.is_success());

    // The hosting instance does not exist; the row must still land so a
    // future worker can materialize it.
    let code = client.instantiate_vertex("ia", "c1", "counter", b"x").await;
    assert!(!code.is_success());

    let row = client.metadata().vertices.row_for_vertex("c1").await?;
    assert_eq!(row.instance, "ia");
    assert_eq!(row.definition, "counter");
    assert_eq!(row.parameters, b"x");

    Ok(())
}

#[tokio::test]
async fn test_define_rejects_bad_names() -> Result<()> {
    let client = CraClient::open("mem://sdk-names").await?;

    assert!(!client.define_vertex("AB", b"", false).await.is_success());
    assert!(!client.define_vertex("abc-", b"", false).await.is_success());
    assert!(client.define_vertex("$root", b"", false).await.is_success());

    Ok(())
}

#[tokio::test]
async fn test_reset_clears_the_namespace() -> Result<()> {
    let client = CraClient::open("mem://sdk-reset").await?;
    let meta = client.metadata();

    meta.vertices.register_vertex("ia", "v", "def", b"").await?;
    assert!(client.reset().await.is_success());
    assert!(meta.vertices.row_for_vertex("v").await.is_err());

    Ok(())
}
