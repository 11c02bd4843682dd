use super::parsing::{
    env_optional, env_or_default, is_supported_media_type, parse_bool, parse_cors_origins,
    parse_environment, parse_f64, parse_string_list, parse_u16, parse_u32, parse_u64,
};
use super::secret::load_or_create_secret_key;
use super::types::{
    ApiSettings, ConfigError, CorsSettings, DatabaseSettings, IntakeSettings, PipelineSettings,
    RedisSettings, RuntimeSettings, S3Settings, SecuritySettings, ServerHost, ServerPort,
    ServerSettings, Settings, TelemetrySettings, VisionSettings,
};

const DEFAULT_MEDIA_TYPES: &[&str] = &["application/pdf", "image/jpeg", "image/jpg", "image/png"];

/// Upper bound for the reconciliation timeouts: one year.
pub(crate) const MAX_PIPELINE_TIMEOUT_SECONDS: u64 = 365 * 24 * 60 * 60;

impl Settings {
    pub(crate) fn load() -> Result<Self, ConfigError> {
        let host = env_or_default("PRINT_OMR_HOST", "0.0.0.0");
        let port = env_or_default("PRINT_OMR_PORT", "8000");

        let environment = parse_environment(
            env_optional("PRINT_OMR_ENV").or_else(|| env_optional("ENVIRONMENT")),
        );
        let strict_config = env_optional("PRINT_OMR_STRICT_CONFIG")
            .map(|value| parse_bool(&value))
            .unwrap_or(false)
            || environment.is_production();

        let project_name = env_or_default("PROJECT_NAME", "Print OMR API");
        let api_v1_str = env_or_default("API_V1_STR", "/api/v1");

        let secret_key = match env_optional("SECRET_KEY") {
            Some(value) => value,
            None => load_or_create_secret_key(),
        };
        let algorithm = env_or_default("ALGORITHM", "HS256");

        let cors_origins = parse_cors_origins(env_optional("BACKEND_CORS_ORIGINS"))?;

        let postgres_server = env_or_default("POSTGRES_SERVER", "localhost");
        let postgres_port = parse_u16("POSTGRES_PORT", env_or_default("POSTGRES_PORT", "5432"))?;
        let postgres_user = env_or_default("POSTGRES_USER", "print_omr");
        let postgres_password = env_or_default("POSTGRES_PASSWORD", "");
        let postgres_db = env_or_default("POSTGRES_DB", "print_omr");
        let database_url = env_optional("DATABASE_URL");

        let redis_host = env_or_default("REDIS_HOST", "localhost");
        let redis_port = parse_u16("REDIS_PORT", env_or_default("REDIS_PORT", "6379"))?;
        let redis_db = parse_u16("REDIS_DB", env_or_default("REDIS_DB", "0"))?;
        let redis_password = env_or_default("REDIS_PASSWORD", "");

        let s3_endpoint = env_or_default("S3_ENDPOINT", "https://s3.amazonaws.com");
        let s3_access_key = env_or_default("S3_ACCESS_KEY", "");
        let s3_secret_key = env_or_default("S3_SECRET_KEY", "");
        let s3_bucket = env_or_default("S3_BUCKET", "print-uploads");
        let s3_region = env_or_default("S3_REGION", "us-east-1");
        let presigned_url_expire_minutes = parse_u64(
            "PRESIGNED_URL_EXPIRE_MINUTES",
            env_or_default("PRESIGNED_URL_EXPIRE_MINUTES", "15"),
        )?;

        let max_upload_size_mb =
            parse_u64("MAX_UPLOAD_SIZE_MB", env_or_default("MAX_UPLOAD_SIZE_MB", "10"))?;
        let allowed_media_types =
            parse_string_list(env_optional("ALLOWED_UPLOAD_MEDIA_TYPES"), DEFAULT_MEDIA_TYPES);
        let max_pages_per_upload =
            parse_u64("MAX_PAGES_PER_UPLOAD", env_or_default("MAX_PAGES_PER_UPLOAD", "10"))?;
        let rate_limit_per_hour = parse_u64(
            "UPLOAD_RATE_LIMIT_PER_HOUR",
            env_or_default("UPLOAD_RATE_LIMIT_PER_HOUR", "30"),
        )?;

        let openai_api_key = env_or_default("OPENAI_API_KEY", "");
        let openai_base_url = env_or_default("OPENAI_BASE_URL", "https://api.openai.com/v1");
        let vision_model = env_or_default("VISION_MODEL", "gpt-4o-mini");
        let vision_max_tokens =
            parse_u32("VISION_MAX_TOKENS", env_or_default("VISION_MAX_TOKENS", "1000"))?;
        let vision_request_timeout =
            parse_u64("VISION_REQUEST_TIMEOUT", env_or_default("VISION_REQUEST_TIMEOUT", "120"))?;
        let image_detail = env_or_default("VISION_IMAGE_DETAIL", "high");

        let review_confidence_threshold = parse_f64(
            "PRINT_REVIEW_CONFIDENCE_THRESHOLD",
            env_or_default("PRINT_REVIEW_CONFIDENCE_THRESHOLD", "0.6"),
        )?;
        let service_token = env_or_default("PRINT_SERVICE_TOKEN", "");
        let trigger_url = env_optional("PRINT_TRIGGER_URL");
        let download_timeout_seconds = parse_u64(
            "STORAGE_DOWNLOAD_TIMEOUT",
            env_or_default("STORAGE_DOWNLOAD_TIMEOUT", "30"),
        )?;
        let received_timeout_seconds = parse_u64(
            "PRINT_RECEIVED_TIMEOUT_SECONDS",
            env_or_default("PRINT_RECEIVED_TIMEOUT_SECONDS", "300"),
        )?;
        let processing_timeout_seconds = match env_optional("PRINT_PROCESSING_TIMEOUT_SECONDS") {
            Some(value) => parse_u64("PRINT_PROCESSING_TIMEOUT_SECONDS", value)?,
            None => vision_request_timeout
                .saturating_add(download_timeout_seconds.saturating_mul(max_pages_per_upload))
                .saturating_add(120)
                .min(MAX_PIPELINE_TIMEOUT_SECONDS),
        };
        let reconcile_interval_seconds = parse_u64(
            "PRINT_RECONCILE_INTERVAL_SECONDS",
            env_or_default("PRINT_RECONCILE_INTERVAL_SECONDS", "60"),
        )?;
        let embedded_worker =
            env_optional("PRINT_EMBEDDED_WORKER").map(|value| parse_bool(&value)).unwrap_or(false);

        let log_level = env_or_default("PRINT_OMR_LOG_LEVEL", "info");
        let json = env_optional("PRINT_OMR_LOG_JSON").map(|value| parse_bool(&value)).unwrap_or(false);
        let prometheus_enabled =
            env_optional("PROMETHEUS_ENABLED").map(|value| parse_bool(&value)).unwrap_or(false);

        let settings = Self {
            server: ServerSettings {
                host: ServerHost::parse(host)?,
                port: ServerPort::parse(port)?,
            },
            runtime: RuntimeSettings { environment, strict_config },
            api: ApiSettings { project_name, api_v1_str },
            security: SecuritySettings { secret_key, algorithm },
            cors: CorsSettings { origins: cors_origins },
            database: DatabaseSettings {
                postgres_server,
                postgres_port,
                postgres_user,
                postgres_password,
                postgres_db,
                database_url,
            },
            redis: RedisSettings {
                host: redis_host,
                port: redis_port,
                db: redis_db,
                password: redis_password,
            },
            s3: S3Settings {
                endpoint: s3_endpoint,
                access_key: s3_access_key,
                secret_key: s3_secret_key,
                bucket: s3_bucket,
                region: s3_region,
                presigned_url_expire_minutes,
            },
            intake: IntakeSettings {
                max_upload_size_mb,
                allowed_media_types,
                max_pages_per_upload,
                rate_limit_per_hour,
            },
            vision: VisionSettings {
                openai_api_key,
                openai_base_url,
                model: vision_model,
                max_tokens: vision_max_tokens,
                request_timeout: vision_request_timeout,
                image_detail,
            },
            pipeline: PipelineSettings {
                review_confidence_threshold,
                service_token,
                trigger_url,
                download_timeout_seconds,
                received_timeout_seconds,
                processing_timeout_seconds,
                reconcile_interval_seconds,
                embedded_worker,
            },
            telemetry: TelemetrySettings { log_level, json, prometheus_enabled },
        };

        settings.validate()?;
        Ok(settings)
    }

    pub(crate) fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host.0, self.server.port.0)
    }

    pub(crate) fn server_host(&self) -> &str {
        &self.server.host.0
    }

    pub(crate) fn server_port(&self) -> u16 {
        self.server.port.0
    }

    pub(crate) fn api(&self) -> &ApiSettings {
        &self.api
    }

    pub(crate) fn security(&self) -> &SecuritySettings {
        &self.security
    }

    pub(crate) fn cors(&self) -> &CorsSettings {
        &self.cors
    }

    pub(crate) fn database(&self) -> &DatabaseSettings {
        &self.database
    }

    pub(crate) fn redis(&self) -> &RedisSettings {
        &self.redis
    }

    pub(crate) fn s3(&self) -> &S3Settings {
        &self.s3
    }

    pub(crate) fn intake(&self) -> &IntakeSettings {
        &self.intake
    }

    pub(crate) fn vision(&self) -> &VisionSettings {
        &self.vision
    }

    pub(crate) fn pipeline(&self) -> &PipelineSettings {
        &self.pipeline
    }

    pub(crate) fn telemetry(&self) -> &TelemetrySettings {
        &self.telemetry
    }

    pub(crate) fn runtime(&self) -> &RuntimeSettings {
        &self.runtime
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.intake.allowed_media_types.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "ALLOWED_UPLOAD_MEDIA_TYPES",
                value: String::from("<empty>"),
            });
        }

        for media_type in &self.intake.allowed_media_types {
            if !is_supported_media_type(media_type) {
                return Err(ConfigError::InvalidValue {
                    field: "ALLOWED_UPLOAD_MEDIA_TYPES",
                    value: media_type.clone(),
                });
            }
        }

        if self.intake.max_pages_per_upload == 0 {
            return Err(ConfigError::InvalidValue {
                field: "MAX_PAGES_PER_UPLOAD",
                value: "0".to_string(),
            });
        }

        let threshold = self.pipeline.review_confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::InvalidValue {
                field: "PRINT_REVIEW_CONFIDENCE_THRESHOLD",
                value: threshold.to_string(),
            });
        }

        for (field, seconds) in [
            ("PRINT_RECEIVED_TIMEOUT_SECONDS", self.pipeline.received_timeout_seconds),
            ("PRINT_PROCESSING_TIMEOUT_SECONDS", self.pipeline.processing_timeout_seconds),
        ] {
            if seconds > MAX_PIPELINE_TIMEOUT_SECONDS {
                return Err(ConfigError::InvalidValue { field, value: seconds.to_string() });
            }
        }

        if self.pipeline.reconcile_interval_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "PRINT_RECONCILE_INTERVAL_SECONDS",
                value: "0".to_string(),
            });
        }

        if !(self.runtime.strict_config || self.runtime.environment.is_production()) {
            return Ok(());
        }

        if self.database.database_url.is_none() && self.database.postgres_password.is_empty() {
            return Err(ConfigError::MissingSecret("POSTGRES_PASSWORD"));
        }
        if self.vision.openai_api_key.is_empty() {
            return Err(ConfigError::MissingSecret("OPENAI_API_KEY"));
        }
        if self.s3.access_key.is_empty() || self.s3.secret_key.is_empty() {
            return Err(ConfigError::MissingSecret("S3_ACCESS_KEY/S3_SECRET_KEY"));
        }
        if self.pipeline.service_token.is_empty() {
            return Err(ConfigError::MissingSecret("PRINT_SERVICE_TOKEN"));
        }

        Ok(())
    }
}
