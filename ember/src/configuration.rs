use std::path::Path;

use secrecy::{ExposeSecret, Secret};
use sqlx::postgres::{PgConnectOptions, PgSslMode};

#[derive(serde::Deserialize, Debug)]
pub struct ApplicationSettings {
    pub port: u16,
    pub host: String,
}

#[derive(serde::Deserialize, Debug, Clone)]
pub struct GithubSettings {
    /// REST API base, e.g. `https://api.github.com` or a GHES
    /// `https://ghes.example.com/api/v3`.
    pub api_url: String,
    /// Base for the URLs runners register against.
    pub html_url: String,
    pub token: Secret<String>,
}

#[derive(serde::Deserialize, Debug, Clone)]
pub struct VmSettings {
    pub daemon_urls: Vec<String>,
    pub work_dir: String,
    pub max_concurrent: usize,
    pub min_free_gib: u64,
    pub max_memory_mib: i64,
    pub max_vcpus: i64,
    pub default_memory_mib: i64,
    pub default_vcpus: i64,
    /// When false the VM path is inactive and container runners are left to
    /// the container controller.
    pub enable_firecracker: bool,
}

#[derive(serde::Deserialize, Debug)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub application: ApplicationSettings,
    pub github: GithubSettings,
    pub vm: VmSettings,
}

#[derive(serde::Deserialize, Debug)]
pub struct DatabaseSettings {
    pub username: String,
    pub password: Secret<String>,
    pub port: u16,
    pub host: String,

    #[serde(rename = "database_name")]
    pub name: String,

    pub max_connections: u32,
}

impl DatabaseSettings {
    pub fn without_db(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .username(&self.username)
            .password(self.password.expose_secret())
            .port(self.port)
            .ssl_mode(PgSslMode::Prefer)
    }

    pub fn with_db(&self) -> PgConnectOptions {
        self.without_db().database(&self.name)
    }

    pub fn connection_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.username,
            self.password.expose_secret(),
            self.host,
            self.port,
            self.name
        )
    }
}

pub fn get_configuration() -> Result<Settings, config::ConfigError> {
    let base_path = Path::new(env!("CARGO_MANIFEST_DIR"));
    let configuration_directory = base_path.join("configuration");
    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .expect("Failed to parse APP_ENVIRONMENT.");
    let environment_filename = format!("{}.yaml", environment.as_str());
    let settings = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(config::File::from(
            configuration_directory.join(environment_filename),
        ))
        // Override database settings from environment variables if set
        .set_override_option("database.host", std::env::var("DATABASE_HOST").ok())?
        .set_override_option("database.port", std::env::var("DATABASE_PORT").ok())?
        .set_override_option("database.username", std::env::var("DATABASE_USERNAME").ok())?
        .set_override_option("database.password", std::env::var("DATABASE_PASSWORD").ok())?
        .set_override_option(
            "database.database_name",
            std::env::var("DATABASE_NAME").ok(),
        )?
        // The PAT is normally injected through the environment, never yaml
        .set_override_option(
            "github.token",
            std::env::var("GITHUB_TOKEN").ok().filter(|s| !s.is_empty()),
        )?
        .set_override_option(
            "github.api_url",
            std::env::var("GITHUB_API_URL")
                .ok()
                .filter(|s| !s.is_empty()),
        )?
        // Comma-separated daemon endpoint list
        .set_override_option(
            "vm.daemon_urls",
            std::env::var("EMBER_DAEMON_URLS").ok().map(|urls| {
                urls.split(',')
                    .map(|u| u.trim().to_string())
                    .filter(|u| !u.is_empty())
                    .collect::<Vec<_>>()
            }),
        )?
        .build()?;
    settings.try_deserialize::<Settings>()
}

pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}
