//! Environment-driven settings.
//!
//! Every knob is a `COURIER_*` environment variable with a default that
//! works for local development (mock backends, memory store, auth
//! disabled).

use courier_core::limiter::LimiterConfig;

#[derive(Debug, Clone)]
pub struct Settings {
    // LLM provider
    pub llm_endpoint: String,
    pub llm_api_key: String,
    pub llm_model: String,
    pub llm_region: String,

    // Browser agent provider
    pub browser_endpoint: String,
    pub browser_api_key: String,

    // App
    pub app_env: String,
    pub app_host: String,
    pub app_port: u16,
    pub cors_origins: String,

    // Browser automation
    pub headless_browser: bool,
    pub max_concurrent_browsers: usize,
    pub browser_timeout_seconds: u64,

    // Rate limits
    pub max_tasks_per_minute: u32,
    pub max_concurrent_tasks: u32,

    // Auth. Empty secret disables authentication entirely.
    pub jwt_secret: String,
    pub jwt_expiry_minutes: i64,
    pub jwt_algorithm: String,

    // Optional external KV
    pub redis_url: String,
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key = %key, value = %raw, "unparseable setting, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => matches!(raw.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            llm_endpoint: env_string("COURIER_LLM_ENDPOINT", ""),
            llm_api_key: env_string("COURIER_LLM_API_KEY", ""),
            llm_model: env_string("COURIER_LLM_MODEL", "nova-lite-v1"),
            llm_region: env_string("COURIER_LLM_REGION", "us-east-1"),
            browser_endpoint: env_string("COURIER_BROWSER_ENDPOINT", ""),
            browser_api_key: env_string("COURIER_BROWSER_API_KEY", ""),
            app_env: env_string("COURIER_APP_ENV", "development"),
            app_host: env_string("COURIER_APP_HOST", "0.0.0.0"),
            app_port: env_parse("COURIER_APP_PORT", 8000),
            cors_origins: env_string(
                "COURIER_CORS_ORIGINS",
                "http://localhost:5173,http://localhost:5174",
            ),
            headless_browser: env_bool("COURIER_HEADLESS_BROWSER", true),
            max_concurrent_browsers: env_parse("COURIER_MAX_CONCURRENT_BROWSERS", 3),
            browser_timeout_seconds: env_parse("COURIER_BROWSER_TIMEOUT_SECONDS", 60),
            max_tasks_per_minute: env_parse("COURIER_MAX_TASKS_PER_MINUTE", 10),
            max_concurrent_tasks: env_parse("COURIER_MAX_CONCURRENT_TASKS", 5),
            jwt_secret: env_string("COURIER_JWT_SECRET", ""),
            jwt_expiry_minutes: env_parse("COURIER_JWT_EXPIRY_MINUTES", 60),
            jwt_algorithm: env_string("COURIER_JWT_ALGORITHM", "HS256"),
            redis_url: env_string("COURIER_REDIS_URL", ""),
        }
    }

    pub fn is_dev(&self) -> bool {
        self.app_env == "development"
    }

    pub fn has_llm_credentials(&self) -> bool {
        !self.llm_api_key.is_empty() && !self.llm_endpoint.is_empty()
    }

    pub fn has_browser_credentials(&self) -> bool {
        !self.browser_api_key.is_empty() && !self.browser_endpoint.is_empty()
    }

    pub fn auth_enabled(&self) -> bool {
        !self.jwt_secret.is_empty()
    }

    pub fn cors_origin_list(&self) -> Vec<String> {
        self.cors_origins
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn limiter_config(&self) -> LimiterConfig {
        LimiterConfig {
            max_tasks_per_minute: self.max_tasks_per_minute,
            max_concurrent_tasks: self.max_concurrent_tasks,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
