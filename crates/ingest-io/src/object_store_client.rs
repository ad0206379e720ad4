//! Object-store client construction ("Object store").
//!
//! The engine only ever needs one concrete backend (S3-compatible, per the
//! teacher's MinIO-flavored `AmazonS3Builder` usage in the old Iceberg sink),
//! but every call site depends on `Arc<dyn ObjectStore>` so a different
//! backend (GCS, Azure, local filesystem for tests) can be swapped in without
//! touching the table writer or optimizer.

use std::sync::Arc;

use ingest_core::StoreConfig;
use object_store::aws::AmazonS3Builder;
use object_store::ObjectStore;

pub fn build_object_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn ObjectStore>> {
    let store = AmazonS3Builder::new()
        .with_endpoint(&config.endpoint)
        .with_region(&config.region)
        .with_bucket_name(&config.bucket)
        .with_access_key_id(&config.access_key)
        .with_secret_access_key(&config.secret_key)
        .with_allow_http(true)
        .with_virtual_hosted_style_request(!config.path_style)
        .build()?;
    Ok(Arc::new(store))
}
