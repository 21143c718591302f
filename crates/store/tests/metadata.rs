use anyhow::Result;

use cra_store::{
    Error, Metadata,
    connections::ConnectionRow,
    endpoints::Direction,
    naming::{ephemeral_instance_name, shard_name, split_shard_name, validate_definition_name},
    vertices::VertexDefinition,
};

async fn open(namespace: &str) -> Result<Metadata> {
    Ok(Metadata::open(&format!("mem://{}", namespace)).await?)
}

#[tokio::test]
async fn test_define_then_instantiate() -> Result<()> {
    let meta = open("define-instantiate").await?;

    meta.vertices
        .define_vertex(&VertexDefinition {
            name: "counter".to_string(),
            creator: b"counter".to_vec(),
            is_sharded: false,
        })
        .await?;

    let definition = meta.vertices.row_for_definition("counter").await?;
    assert_eq!(definition.creator, b"counter");
    assert!(!definition.is_sharded);

    meta.vertices
        .register_vertex("worker-a", "c1", "counter", b"p")
        .await?;

    let row = meta.vertices.vertex_row("worker-a", "c1").await?;
    assert_eq!(row.definition, "counter");
    assert_eq!(row.parameters, b"p");
    assert_eq!(meta.vertices.row_for_vertex("c1").await?, row);

    Ok(())
}

#[tokio::test]
async fn test_instance_reregistration_replaces_address() -> Result<()> {
    let meta = open("instance-rereg").await?;

    meta.vertices
        .register_instance("worker-a", "10.0.0.1", 11000)
        .await?;
    meta.vertices
        .register_instance("worker-a", "10.0.0.2", 11001)
        .await?;

    let instance = meta.vertices.instance_for_name("worker-a").await?;
    assert_eq!(instance.address, "10.0.0.2");
    assert_eq!(instance.port, 11001);
    assert_eq!(meta.vertices.all_instances().await?.len(), 1);

    meta.vertices.delete_instance("worker-a").await?;
    assert!(matches!(
        meta.vertices.instance_for_name("worker-a").await,
        Err(Error::NotFound)
    ));

    Ok(())
}

#[tokio::test]
async fn test_row_for_vertex_prefers_earliest_insertion() -> Result<()> {
    let meta = open("vertex-tiebreak").await?;

    meta.vertices
        .register_vertex("worker-b", "v", "def-b", b"")
        .await?;
    meta.vertices
        .register_vertex("worker-a", "v", "def-a", b"")
        .await?;

    // worker-b's row was inserted first even though it sorts later.
    assert_eq!(meta.vertices.row_for_vertex("v").await?.instance, "worker-b");

    // The active variant skips instances without an address row.
    meta.vertices
        .register_instance("worker-a", "127.0.0.1", 11000)
        .await?;
    assert_eq!(
        meta.vertices.row_for_active_vertex("v").await?.instance,
        "worker-a"
    );

    Ok(())
}

#[tokio::test]
async fn test_endpoint_rows() -> Result<()> {
    let meta = open("endpoints").await?;

    meta.endpoints
        .add_endpoint("v", "in", Direction::Input, true)
        .await?;
    meta.endpoints
        .add_endpoint("v", "out", Direction::Output, false)
        .await?;

    // Re-adding an identical endpoint is a no-op.
    meta.endpoints
        .add_endpoint("v", "in", Direction::Input, true)
        .await?;

    // Direction and async are immutable after creation.
    assert!(matches!(
        meta.endpoints
            .add_endpoint("v", "in", Direction::Output, true)
            .await,
        Err(Error::Conflict)
    ));
    assert!(matches!(
        meta.endpoints
            .add_endpoint("v", "in", Direction::Input, false)
            .await,
        Err(Error::Conflict)
    ));

    let inputs = meta.endpoints.endpoints_of("v", Direction::Input).await?;
    assert_eq!(inputs.len(), 1);
    assert!(inputs[0].is_async);

    meta.endpoints.delete_endpoint("v", "in").await?;
    assert!(meta.endpoints.endpoint_row("v", "in").await?.is_none());

    meta.endpoints.delete_all_for_vertex("v").await?;
    assert!(meta.endpoints.all_endpoints_of("v").await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_connection_insert_is_idempotent() -> Result<()> {
    let meta = open("connections").await?;

    let connection = ConnectionRow::new("a", "out", "b", "in");
    meta.connections.add_connection(&connection).await?;
    meta.connections.add_connection(&connection).await?;

    assert_eq!(meta.connections.connections_from("a").await?.len(), 1);
    assert_eq!(
        meta.connections.connections_to("b").await?,
        vec![connection.clone()]
    );

    meta.connections.delete_connection(&connection).await?;
    assert!(meta.connections.connections_from("a").await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_delete_all_connections_for_vertex() -> Result<()> {
    let meta = open("connections-bidir").await?;

    meta.connections
        .add_connection(&ConnectionRow::new("v", "out", "b", "in"))
        .await?;
    meta.connections
        .add_connection(&ConnectionRow::new("a", "out", "v", "in"))
        .await?;
    meta.connections
        .add_connection(&ConnectionRow::new("a", "out", "b", "in"))
        .await?;

    meta.connections.delete_all_for_vertex("v").await?;

    assert!(meta.connections.connections_from("v").await?.is_empty());
    assert!(meta.connections.connections_to("v").await?.is_empty());
    assert_eq!(meta.connections.connections_from("a").await?.len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_batched_partition_delete() -> Result<()> {
    let meta = open("batch-delete").await?;

    // More rows than one 100-row batch.
    for index in 0..250 {
        meta.endpoints
            .add_endpoint("big", &format!("ep{}", index), Direction::Input, false)
            .await?;
    }

    meta.endpoints.delete_all_for_vertex("big").await?;
    assert!(meta.endpoints.all_endpoints_of("big").await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_sharding_epochs() -> Result<()> {
    let meta = open("sharding").await?;

    let instances = vec!["worker-a".to_string(), "worker-b".to_string()];
    meta.sharded
        .register("src", &instances, &[0, 1, 2], &[0, 1, 2], &[], Some("mod"))
        .await?;
    let info = meta
        .sharded
        .register("src", &instances, &[0, 1, 2, 3], &[3], &[], Some("mod"))
        .await?;
    assert_eq!(info.epoch, 1);

    let latest = meta.sharded.latest_sharding_info("src").await?;
    assert_eq!(latest.epoch, 1);
    assert_eq!(latest.all_shards, vec![0, 1, 2, 3]);
    assert_eq!(latest.added_shards, vec![3]);
    assert_eq!(latest.shard_locator.as_deref(), Some("mod"));

    meta.vertices
        .register_vertex("worker-a", &shard_name("src", 0), "def", b"")
        .await?;
    meta.vertices
        .register_vertex("worker-b", &shard_name("src", 1), "def", b"")
        .await?;
    // A different base sharing the prefix must not leak into the scan.
    meta.vertices
        .register_vertex("worker-a", &shard_name("srcx", 0), "def", b"")
        .await?;

    assert_eq!(meta.sharded.rows_for_sharded_vertex("src").await?.len(), 2);

    meta.sharded.delete("src").await?;
    assert!(matches!(
        meta.sharded.latest_sharding_info("src").await,
        Err(Error::NotFound)
    ));

    Ok(())
}

#[tokio::test]
async fn test_artifact_round_trip() -> Result<()> {
    let meta = open("artifacts").await?;

    meta.artifacts.upload("counter", b"binary blob").await?;
    assert_eq!(meta.artifacts.download("counter").await?, b"binary blob");

    meta.artifacts.delete("counter").await?;
    assert!(matches!(
        meta.artifacts.download("counter").await,
        Err(Error::NotFound)
    ));

    Ok(())
}

#[tokio::test]
async fn test_reset_empties_every_table() -> Result<()> {
    let meta = open("reset").await?;

    meta.vertices
        .register_instance("worker-a", "127.0.0.1", 11000)
        .await?;
    meta.vertices
        .register_vertex("worker-a", "v", "def", b"")
        .await?;
    meta.endpoints
        .add_endpoint("v", "in", Direction::Input, true)
        .await?;
    meta.connections
        .add_connection(&ConnectionRow::new("v", "out", "b", "in"))
        .await?;
    meta.sharded
        .register("v", &["worker-a".to_string()], &[0], &[0], &[], None)
        .await?;
    meta.artifacts.upload("def-name", b"blob").await?;

    meta.reset().await?;

    assert!(meta.vertices.all_instances().await?.is_empty());
    assert!(
        meta.vertices
            .all_vertices_for_instance("worker-a")
            .await?
            .is_empty()
    );
    assert!(meta.endpoints.all_endpoints_of("v").await?.is_empty());
    assert!(meta.connections.connections_from("v").await?.is_empty());
    assert!(matches!(
        meta.sharded.latest_sharding_info("v").await,
        Err(Error::NotFound)
    ));
    assert!(matches!(
        meta.artifacts.download("def-name").await,
        Err(Error::NotFound)
    ));

    Ok(())
}

#[test]
fn test_definition_name_rules() {
    for name in ["ab-cd", "a1b2c3", "$root", "abc", "a--b", "0ab"] {
        assert!(validate_definition_name(name).is_ok(), "{}", name);
    }

    let too_long = "a".repeat(64);
    for name in ["AB", "a", "ab", "-abc", "abc-", "a_bc", too_long.as_str()] {
        assert!(validate_definition_name(name).is_err(), "{}", name);
    }

    assert!(validate_definition_name(&"a".repeat(63)).is_ok());
}

#[test]
fn test_shard_names() {
    assert_eq!(shard_name("src", 3), "src$3");
    assert_eq!(split_shard_name("src$3"), Some(("src", 3)));
    assert_eq!(split_shard_name("plain"), None);
    assert_eq!(split_shard_name("$3"), None);
    assert_eq!(split_shard_name("src$x"), None);
}

#[test]
fn test_ephemeral_instance_names() {
    for _ in 0..32 {
        let name = ephemeral_instance_name();
        assert_eq!(name.len(), 16);
        assert!(name.bytes().all(|byte| byte.is_ascii_lowercase()));
    }

    assert_ne!(ephemeral_instance_name(), ephemeral_instance_name());
}
