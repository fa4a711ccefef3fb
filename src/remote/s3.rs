use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::StorageClass;
use aws_sdk_s3::Client;
use std::path::Path;
use tokio::runtime::{Builder as RuntimeBuilder, Runtime};
use tracing::debug;

use super::{ObjectStore, RemoteError};
use crate::config::RemoteSettings;
use crate::error::{Error, Result};

/// Object store backed by Amazon S3 or an S3-compatible service.
///
/// The rest of the crate is synchronous, so calls are driven to completion
/// on a private single-threaded runtime.
pub struct S3ObjectStore {
    runtime: Runtime,
    client: Client,
}

impl S3ObjectStore {
    pub fn new(settings: &RemoteSettings) -> Result<Self> {
        let runtime = RuntimeBuilder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Config(format!("cannot start S3 runtime: {}", e)))?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()));
        if let (Some(key_id), Some(secret)) =
            (&settings.aws_access_key_id, &settings.aws_secret_access_key)
        {
            loader = loader.credentials_provider(Credentials::new(
                key_id.clone(),
                secret.clone(),
                None,
                None,
                "pec-archiver",
            ));
        }
        if let Some(endpoint) = &settings.endpoint_url {
            debug!(endpoint = %endpoint, "using custom S3 endpoint");
            loader = loader.endpoint_url(endpoint.clone());
        }
        let sdk_config = runtime.block_on(loader.load());
        let client = Client::new(&sdk_config);
        Ok(S3ObjectStore { runtime, client })
    }
}

fn to_remote_error<E>(err: SdkError<E, HttpResponse>) -> RemoteError
where
    E: std::error::Error + Send + Sync + 'static,
{
    match err.raw_response().map(|raw| raw.status().as_u16()) {
        Some(404) => RemoteError::NotFound,
        Some(403) => RemoteError::Forbidden,
        _ => RemoteError::Other(DisplayErrorContext(err).to_string()),
    }
}

impl ObjectStore for S3ObjectStore {
    fn head_bucket(&self, bucket: &str) -> std::result::Result<(), RemoteError> {
        self.runtime
            .block_on(self.client.head_bucket().bucket(bucket).send())
            .map(|_| ())
            .map_err(to_remote_error)
    }

    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
        storage_class: Option<&str>,
    ) -> std::result::Result<(), RemoteError> {
        self.runtime.block_on(async {
            let body = ByteStream::from_path(path)
                .await
                .map_err(|e| RemoteError::Other(e.to_string()))?;
            self.client
                .put_object()
                .bucket(bucket)
                .key(key)
                .body(body)
                .set_storage_class(storage_class.map(StorageClass::from))
                .send()
                .await
                .map(|_| ())
                .map_err(to_remote_error)
        })
    }
}
