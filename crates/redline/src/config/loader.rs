use std::path::Path;

use crate::codec::DocumentFormat;
use crate::config::schema::{EngineConfig, MAX_FILE_TTL_SECS};
use crate::error::ConfigError;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<EngineConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig = serde_json::from_str(content)?;

    validate_config(&config)?;

    Ok(config)
}

pub fn validate_config(config: &EngineConfig) -> Result<(), ConfigError> {
    if config.worker_count == 0 {
        return Err(invalid("worker_count must be at least 1"));
    }
    if config.file_ttl_secs == 0 {
        return Err(invalid("file_ttl_secs must be greater than 0"));
    }
    if config.file_ttl_secs > MAX_FILE_TTL_SECS {
        return Err(invalid(&format!(
            "file_ttl_secs must be at most {}",
            MAX_FILE_TTL_SECS
        )));
    }
    if config.subscriber_buffer == 0 {
        return Err(invalid("subscriber_buffer must be greater than 0"));
    }
    if config.sweep_interval_secs == 0 {
        return Err(invalid("sweep_interval_secs must be greater than 0"));
    }
    if config.upload.max_upload_bytes == 0 {
        return Err(invalid("upload.max_upload_bytes must be greater than 0"));
    }

    if config.upload.allowed_extensions.is_empty() {
        return Err(invalid("upload.allowed_extensions must not be empty"));
    }
    for ext in &config.upload.allowed_extensions {
        if DocumentFormat::from_extension(ext).is_none() {
            return Err(invalid(&format!(
                "upload.allowed_extensions contains unsupported extension '{}'",
                ext
            )));
        }
    }

    let pipeline = &config.pipeline;
    if pipeline.analyze_timeout_secs == 0 || pipeline.integrate_timeout_secs == 0 {
        return Err(invalid("pipeline timeouts must be greater than 0"));
    }
    if pipeline.max_chunk_chars == 0 {
        return Err(invalid("pipeline.max_chunk_chars must be greater than 0"));
    }
    if pipeline.categories.is_empty() {
        return Err(invalid("pipeline.categories must not be empty"));
    }

    let pricing = &config.pricing;
    if !(pricing.input_per_1k_tokens >= 0.0 && pricing.output_per_1k_tokens >= 0.0) {
        return Err(invalid("pricing values must be non-negative numbers"));
    }

    Ok(())
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Validation {
        message: message.to_string(),
    }
}
