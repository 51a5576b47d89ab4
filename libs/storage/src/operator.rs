use anyhow::Result;
use opendal::services;
use opendal::Operator;

use crate::config::StorageConfig;

/// Build an operator for the configured backend without touching the network
pub fn create_operator(config: &StorageConfig) -> Result<Operator> {
    let op = match config {
        StorageConfig::Fs {
            root,
            atomic_write_dir,
        } => {
            tracing::info!("[storage] fs backend rooted at {}", root);
            let mut builder = services::Fs::default().root(root);
            if let Some(dir) = atomic_write_dir {
                builder = builder.atomic_write_dir(dir);
            }
            Operator::new(builder)?.finish()
        }
        StorageConfig::S3 {
            bucket,
            root,
            region,
            endpoint,
            access_key_id,
            secret_access_key,
            session_token,
            disable_config_load,
            enable_virtual_host_style,
        } => {
            tracing::info!("[storage] s3 backend bucket={} region={:?}", bucket, region);
            let mut builder = services::S3::default()
                .bucket(bucket)
                .root(root.trim_start_matches('/'));
            if let Some(v) = region {
                builder = builder.region(v);
            }
            if let Some(v) = endpoint {
                builder = builder.endpoint(v);
            }
            if let Some(v) = access_key_id {
                builder = builder.access_key_id(v);
            }
            if let Some(v) = secret_access_key {
                builder = builder.secret_access_key(v);
            }
            if let Some(v) = session_token {
                builder = builder.session_token(v);
            }
            if *disable_config_load {
                builder = builder.disable_config_load();
            }
            if *enable_virtual_host_style {
                builder = builder.enable_virtual_host_style();
            }
            Operator::new(builder)?.finish()
        }
        StorageConfig::Oss {
            bucket,
            root,
            region,
            endpoint,
            access_key_id,
            access_key_secret,
            security_token,
        } => {
            tracing::info!("[storage] oss backend bucket={} region={}", bucket, region);
            let mut builder = services::S3::default()
                .bucket(bucket)
                .root(root.trim_start_matches('/'))
                .region(region)
                .endpoint(endpoint)
                .enable_virtual_host_style();
            if let Some(v) = access_key_id {
                builder = builder.access_key_id(v);
            }
            if let Some(v) = access_key_secret {
                builder = builder.secret_access_key(v);
            }
            if let Some(v) = security_token {
                builder = builder.session_token(v);
            }
            Operator::new(builder)?.finish()
        }
    };
    tracing::debug!(
        "[storage] {} operator ready, append={} presign={}",
        config.kind(),
        op.info().full_capability().write_can_append,
        op.info().full_capability().presign_read
    );
    Ok(op)
}

pub async fn test_connection(operator: &Operator) -> Result<()> {
    operator.check().await?;
    tracing::info!("[storage] connection check passed");
    Ok(())
}

/// Create the operator and probe it; a failing probe is logged, not fatal
pub async fn init_operator(config: &StorageConfig) -> Result<Operator> {
    let operator = create_operator(config)?;
    if let Err(e) = test_connection(&operator).await {
        tracing::warn!(
            "[storage] {} backend check failed: {}, continuing anyway",
            config.kind(),
            e
        );
    }
    Ok(operator)
}
