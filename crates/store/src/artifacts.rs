use std::sync::Arc;

use async_trait::async_trait;
use base64::{Engine, prelude::BASE64_STANDARD};

use super::{ARTIFACT_CONTAINER, Error, TableEntity, TableService, naming};

const BINARIES_ROW: &str = "binaries";
const COL_BLOB: &str = "blob";

/// Opaque binary store mapping a vertex-definition name to the blob a
/// worker needs to instantiate vertices of that type.
///
/// Keys are validated against the DNS-style definition naming rules.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn upload(&self, definition: &str, bytes: &[u8]) -> Result<(), Error>;
    async fn download(&self, definition: &str) -> Result<Vec<u8>, Error>;
    async fn delete(&self, definition: &str) -> Result<(), Error>;
}

/// Artifact store layered on the table service: container `cra`, one entry
/// `<definition>/binaries` per definition.
pub struct TableArtifactStore {
    service: Arc<dyn TableService>,
}

impl TableArtifactStore {
    pub fn new(service: Arc<dyn TableService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl ArtifactStore for TableArtifactStore {
    async fn upload(&self, definition: &str, bytes: &[u8]) -> Result<(), Error> {
        naming::validate_definition_name(definition)?;

        let entity = TableEntity::new(definition, BINARIES_ROW)
            .with_column(COL_BLOB, BASE64_STANDARD.encode(bytes));
        self.service.upsert(ARTIFACT_CONTAINER, entity).await
    }

    async fn download(&self, definition: &str) -> Result<Vec<u8>, Error> {
        let entity = self
            .service
            .get(ARTIFACT_CONTAINER, definition, BINARIES_ROW)
            .await?
            .ok_or(Error::NotFound)?;

        BASE64_STANDARD
            .decode(entity.column(COL_BLOB)?)
            .map_err(|_| Error::InvalidColumn(COL_BLOB))
    }

    async fn delete(&self, definition: &str) -> Result<(), Error> {
        self.service
            .delete(ARTIFACT_CONTAINER, definition, BINARIES_ROW)
            .await
    }
}
