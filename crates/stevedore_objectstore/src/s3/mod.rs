use async_trait::async_trait;
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use aws_credential_types::Credentials;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use http::Uri;
use serde::Deserialize;

pub(crate) mod logging;
use super::errors::{Error, Result};
use super::s3::logging::TracingInterceptor;
use super::{Key, ObjectStore};

#[derive(Clone, Debug, Deserialize)]
pub struct S3Config {
    secret_key: String,
    access_key: String,
    hostname: String,
    bucket_name: String,
    region: String,
}

impl S3Config {
    pub async fn new_objects(&self) -> Result<S3> {
        let scp = SharedCredentialsProvider::new(
            Credentials::new(
                self.access_key.clone(),
                self.secret_key.clone(),
                None,
                None,
                "stevedore",
            )
            .provide_credentials()
            .await?,
        );

        let uri = Uri::builder()
            .scheme("https")
            .authority(self.hostname.as_str())
            .path_and_query("/")
            .build()?;

        let sdk_config = aws_config::load_from_env().await;

        let config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .region(Region::new(self.region.clone()))
            .credentials_provider(scp)
            .endpoint_url(uri.to_string())
            .interceptor(TracingInterceptor)
            .build();

        tracing::info!("using s3 bucket {} at {}", self.bucket_name, self.hostname);
        Ok(S3 {
            bucket_name: self.bucket_name.clone(),
            client: Client::from_conf(config),
        })
    }
}

/// Flat [`ObjectStore`] adapter over an S3 compatible bucket.
#[derive(Clone)]
pub struct S3 {
    bucket_name: String,
    client: Client,
}

#[async_trait]
impl ObjectStore for S3 {
    async fn get(&self, key: &Key) -> Result<Bytes> {
        let output = match self
            .client
            .get_object()
            .key(String::from(key))
            .bucket(&self.bucket_name)
            .send()
            .await
        {
            Err(SdkError::ServiceError(e)) if e.err().is_no_such_key() => {
                return Err(Error::NotFound(key.to_string()))
            }
            Err(e) => return Err(e.into()),
            Ok(output) => output,
        };
        Ok(output.body.collect().await?.into_bytes())
    }

    async fn exists(&self, key: &Key) -> Result<bool> {
        match self
            .client
            .head_object()
            .key(String::from(key))
            .bucket(&self.bucket_name)
            .send()
            .await
        {
            Err(SdkError::ServiceError(e)) if e.err().is_not_found() => Ok(false),
            Err(e) => Err(Error::AWSSDKHeadObjectError(e)),
            Ok(_) => Ok(true),
        }
    }

    async fn put(&self, key: &Key, body: Bytes) -> Result<()> {
        let content_length = body.len() as i64;
        self.client
            .put_object()
            .key(String::from(key))
            .body(ByteStream::from(body))
            .content_length(content_length)
            .bucket(&self.bucket_name)
            .send()
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &Key) -> Result<()> {
        // S3 deletes are idempotent, absence has to be checked up front
        if !self.exists(key).await? {
            return Err(Error::NotFound(key.to_string()));
        }
        self.client
            .delete_object()
            .key(String::from(key))
            .bucket(&self.bucket_name)
            .send()
            .await?;
        Ok(())
    }
}
