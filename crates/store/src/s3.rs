//! [`ObjectStore`] over `aws-sdk-s3`.

use aws_sdk_s3::Client;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use bigcopy_types::{FinishedPart, ObjectPath};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

use crate::{ObjectMeta, ObjectStore, StoreError, StoreFuture};

/// Error codes S3 documents as safe to retry.
const RETRYABLE_CODES: &[&str] = &[
    "InternalError",
    "RequestTimeout",
    "ServiceUnavailable",
    "SlowDown",
    "Throttling",
];

/// S3-backed store. The client is built and authenticated by the caller.
#[derive(Debug, Clone)]
pub struct S3Store {
    client: Client,
}

impl S3Store {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Characters left as-is in a copy source: unreserved ones plus `/`.
const COPY_SOURCE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

fn map_sdk_error<E>(op: &str, err: SdkError<E>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let message = format!("{op}: {}", DisplayErrorContext(&err));
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StoreError::Transient(message)
        }
        SdkError::ServiceError(service) => classify_service_error(
            service.err().code(),
            service.raw().status().is_server_error(),
            message,
        ),
        _ => StoreError::Service(message),
    }
}

fn classify_service_error(code: Option<&str>, server_error: bool, message: String) -> StoreError {
    match code {
        Some("NoSuchUpload") => StoreError::NoSuchUpload(message),
        Some("InvalidPart" | "InvalidPartOrder") => StoreError::InvalidPart(message),
        Some(code) if RETRYABLE_CODES.contains(&code) => StoreError::Transient(message),
        _ if server_error => StoreError::Transient(message),
        _ => StoreError::Service(message),
    }
}

/// `x-amz-copy-source` value for `src`, URL-encoded as S3 requires.
fn copy_source(src: &ObjectPath) -> String {
    format!(
        "{}/{}",
        src.bucket,
        utf8_percent_encode(&src.key, COPY_SOURCE_SET)
    )
}

fn to_chrono(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}

impl ObjectStore for S3Store {
    fn create_multipart_upload<'a>(&'a self, dst: &'a ObjectPath) -> StoreFuture<'a, String> {
        Box::pin(async move {
            let output = self
                .client
                .create_multipart_upload()
                .bucket(&dst.bucket)
                .key(&dst.key)
                .send()
                .await
                .map_err(|e| map_sdk_error("create_multipart_upload", e))?;
            output
                .upload_id()
                .map(str::to_string)
                .ok_or_else(|| StoreError::Service("response carried no upload id".into()))
        })
    }

    fn upload_part<'a>(
        &'a self,
        dst: &'a ObjectPath,
        upload_id: &'a str,
        part_number: u32,
        body: Bytes,
    ) -> StoreFuture<'a, String> {
        Box::pin(async move {
            let len = body.len() as i64;
            let output = self
                .client
                .upload_part()
                .bucket(&dst.bucket)
                .key(&dst.key)
                .upload_id(upload_id)
                .part_number(part_number as i32)
                .content_length(len)
                .body(ByteStream::from(body))
                .send()
                .await
                .map_err(|e| map_sdk_error("upload_part", e))?;
            output
                .e_tag()
                .map(str::to_string)
                .ok_or_else(|| StoreError::Service("upload_part returned no ETag".into()))
        })
    }

    fn upload_part_copy<'a>(
        &'a self,
        dst: &'a ObjectPath,
        upload_id: &'a str,
        part_number: u32,
        src: &'a ObjectPath,
    ) -> StoreFuture<'a, String> {
        Box::pin(async move {
            let output = self
                .client
                .upload_part_copy()
                .bucket(&dst.bucket)
                .key(&dst.key)
                .upload_id(upload_id)
                .part_number(part_number as i32)
                .copy_source(copy_source(src))
                .send()
                .await
                .map_err(|e| map_sdk_error("upload_part_copy", e))?;
            output
                .copy_part_result()
                .and_then(|r| r.e_tag())
                .map(str::to_string)
                .ok_or_else(|| StoreError::Service("upload_part_copy returned no ETag".into()))
        })
    }

    fn complete_multipart_upload<'a>(
        &'a self,
        dst: &'a ObjectPath,
        upload_id: &'a str,
        parts: Vec<FinishedPart>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let completed: Vec<CompletedPart> = parts
                .into_iter()
                .map(|p| {
                    CompletedPart::builder()
                        .e_tag(p.etag)
                        .part_number(p.part_number as i32)
                        .build()
                })
                .collect();
            self.client
                .complete_multipart_upload()
                .bucket(&dst.bucket)
                .key(&dst.key)
                .upload_id(upload_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(completed))
                        .build(),
                )
                .send()
                .await
                .map_err(|e| map_sdk_error("complete_multipart_upload", e))?;
            Ok(())
        })
    }

    fn abort_multipart_upload<'a>(
        &'a self,
        dst: &'a ObjectPath,
        upload_id: &'a str,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.client
                .abort_multipart_upload()
                .bucket(&dst.bucket)
                .key(&dst.key)
                .upload_id(upload_id)
                .send()
                .await
                .map_err(|e| map_sdk_error("abort_multipart_upload", e))?;
            Ok(())
        })
    }

    fn put_object<'a>(&'a self, dst: &'a ObjectPath, body: Bytes) -> StoreFuture<'a, String> {
        Box::pin(async move {
            let output = self
                .client
                .put_object()
                .bucket(&dst.bucket)
                .key(&dst.key)
                .body(ByteStream::from(body))
                .send()
                .await
                .map_err(|e| map_sdk_error("put_object", e))?;
            Ok(output.e_tag().unwrap_or_default().to_string())
        })
    }

    fn get_object<'a>(&'a self, src: &'a ObjectPath) -> StoreFuture<'a, Option<Bytes>> {
        Box::pin(async move {
            let result = self
                .client
                .get_object()
                .bucket(&src.bucket)
                .key(&src.key)
                .send()
                .await;
            let output = match result {
                Ok(output) => output,
                Err(err)
                    if err
                        .as_service_error()
                        .is_some_and(|e| e.is_no_such_key()) =>
                {
                    return Ok(None);
                }
                Err(err) => return Err(map_sdk_error("get_object", err)),
            };
            let data = output
                .body
                .collect()
                .await
                .map_err(|e| StoreError::Transient(format!("get_object body: {e}")))?;
            Ok(Some(data.into_bytes()))
        })
    }

    fn head_object<'a>(&'a self, src: &'a ObjectPath) -> StoreFuture<'a, Option<ObjectMeta>> {
        Box::pin(async move {
            let result = self
                .client
                .head_object()
                .bucket(&src.bucket)
                .key(&src.key)
                .send()
                .await;
            match result {
                Ok(output) => Ok(Some(ObjectMeta {
                    key: src.key.clone(),
                    size: output.content_length().unwrap_or(0).max(0) as u64,
                    etag: output.e_tag().map(str::to_string),
                    last_modified: output.last_modified().and_then(to_chrono),
                })),
                Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => Ok(None),
                Err(err) => Err(map_sdk_error("head_object", err)),
            }
        })
    }

    fn list_objects<'a>(
        &'a self,
        bucket: &'a str,
        prefix: &'a str,
    ) -> StoreFuture<'a, Vec<ObjectMeta>> {
        Box::pin(async move {
            let mut objects = Vec::new();
            let mut token: Option<String> = None;
            loop {
                let output = self
                    .client
                    .list_objects_v2()
                    .bucket(bucket)
                    .prefix(prefix)
                    .set_continuation_token(token.take())
                    .send()
                    .await
                    .map_err(|e| map_sdk_error("list_objects_v2", e))?;
                for object in output.contents() {
                    let Some(key) = object.key() else { continue };
                    objects.push(ObjectMeta {
                        key: key.to_string(),
                        size: object.size().unwrap_or(0).max(0) as u64,
                        etag: object.e_tag().map(str::to_string),
                        last_modified: object.last_modified().and_then(to_chrono),
                    });
                }
                match output.next_continuation_token() {
                    Some(next) if output.is_truncated().unwrap_or(false) => {
                        token = Some(next.to_string());
                    }
                    _ => break,
                }
            }
            objects.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(objects)
        })
    }

    fn delete_object<'a>(&'a self, path: &'a ObjectPath) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.client
                .delete_object()
                .bucket(&path.bucket)
                .key(&path.key)
                .send()
                .await
                .map_err(|e| map_sdk_error("delete_object", e))?;
            Ok(())
        })
    }
}
