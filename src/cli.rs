//! CLI argument parsing, validation, and startup helpers.

use crate::db::Database;
use crate::jwks::KeySource;
use crate::jwt::JwtConfig;
use crate::lockout::LockoutPolicy;
use crate::service::AuthSettings;
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{error, info};
use url::Url;

const MIN_JWT_SECRET_LENGTH: usize = 32;

#[derive(clap::ValueEnum, Clone, Debug, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

/// Proxy header carrying the client address.
#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientIpHeader {
    XForwardedFor,
    XRealIp,
    CfConnectingIp,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "credgate",
    about = "Password credential service issuing signed access tokens"
)]
pub struct Args {
    /// Port to listen on
    #[arg(short, long, env = "CREDGATE_PORT", default_value = "7300")]
    pub port: u16,

    /// Path to SQLite database file
    #[arg(short, long, env = "CREDGATE_DATABASE", default_value = "credgate.db")]
    pub database: String,

    /// Path to file containing the HS256 secret. Prefer using JWT_SECRET env var instead
    #[arg(long)]
    pub jwt_secret_file: Option<String>,

    /// PEM RSA private key; selects RS256 signing
    #[arg(long, env = "CREDGATE_JWT_PRIVATE_KEY_FILE")]
    pub jwt_private_key_file: Option<PathBuf>,

    /// PEM SPKI public key matching the private key; published at /.well-known/jwks.json
    #[arg(long, env = "CREDGATE_JWT_PUBLIC_KEY_FILE")]
    pub jwt_public_key_file: Option<PathBuf>,

    /// Key identifier placed in token headers and the discovery document
    #[arg(long, env = "CREDGATE_JWT_KID", default_value = "primary")]
    pub jwt_kid: String,

    /// Expected and issued `iss` claim
    #[arg(long, env = "CREDGATE_ISSUER")]
    pub issuer: Option<String>,

    /// Expected and issued `aud` claim
    #[arg(long, env = "CREDGATE_AUDIENCE")]
    pub audience: Option<String>,

    /// Public base URL used in emailed links
    #[arg(long, env = "CREDGATE_PUBLIC_URL", default_value = "http://localhost:7300")]
    pub public_url: String,

    /// Access token lifetime in seconds
    #[arg(long, default_value = "900", value_parser = clap::value_parser!(i64).range(1..))]
    pub access_ttl_secs: i64,

    /// Refresh session lifetime in seconds
    #[arg(long, default_value = "1209600", value_parser = clap::value_parser!(i64).range(1..))]
    pub refresh_ttl_secs: i64,

    /// Failed logins per (email, ip) before locking
    #[arg(long, default_value = "5", value_parser = clap::value_parser!(i64).range(1..))]
    pub max_attempts_per_ip: i64,

    #[arg(long, default_value = "15", value_parser = clap::value_parser!(i64).range(1..))]
    pub lock_minutes_ip: i64,

    /// Failed logins per email, across all IPs, before locking
    #[arg(long, default_value = "10", value_parser = clap::value_parser!(i64).range(1..))]
    pub max_attempts_per_email: i64,

    #[arg(long, default_value = "30", value_parser = clap::value_parser!(i64).range(1..))]
    pub lock_minutes_email: i64,

    /// Read the client IP from this proxy header instead of the socket address
    #[arg(long, env = "CREDGATE_IP_HEADER")]
    pub ip_header: Option<ClientIpHeader>,

    /// Log output format
    #[arg(short, long, default_value = "pretty")]
    pub log_format: LogFormat,
}

/// Initialize logging based on the specified format.
pub fn init_logging(format: &LogFormat) {
    match format {
        LogFormat::Pretty => tracing_subscriber::fmt::init(),
        LogFormat::Json => tracing_subscriber::fmt().json().init(),
        LogFormat::Compact => tracing_subscriber::fmt().compact().init(),
    }
}

/// Load JWT secret from environment variable or file.
/// Returns None and logs an error if the secret cannot be loaded.
pub fn load_jwt_secret(jwt_secret_file: Option<&str>) -> Option<String> {
    let secret = if let Ok(secret) = std::env::var("JWT_SECRET") {
        // SAFETY: called during single-threaded startup, before the runtime spawns tasks
        // that could read the environment.
        unsafe { std::env::remove_var("JWT_SECRET") };
        secret
    } else if let Some(path) = jwt_secret_file {
        match std::fs::read_to_string(path) {
            Ok(content) => content.trim().to_string(),
            Err(e) => {
                error!(path = %path, error = %e, "Failed to read JWT secret file");
                return None;
            }
        }
    } else {
        error!(
            "No signing key configured. Set JWT_SECRET, --jwt-secret-file, or --jwt-private-key-file"
        );
        return None;
    };

    if secret.len() < MIN_JWT_SECRET_LENGTH {
        error!(
            "JWT secret is shorter than {} characters. Use a longer secret",
            MIN_JWT_SECRET_LENGTH
        );
        return None;
    }

    Some(secret)
}

/// Signing configuration and, for RS256, where the public key lives.
pub struct KeyMaterial {
    pub jwt: JwtConfig,
    pub public_key: Option<KeySource>,
}

/// Select RS256 when a private key is given, HS256 otherwise.
/// Returns None and logs an error if key material is missing or unreadable.
pub fn load_key_material(args: &Args) -> Option<KeyMaterial> {
    let (jwt, public_key) = match &args.jwt_private_key_file {
        Some(private_path) => {
            let Some(public_path) = &args.jwt_public_key_file else {
                error!("--jwt-public-key-file is required with --jwt-private-key-file");
                return None;
            };
            let private_pem = read_key_file(private_path)?;
            let public_pem = read_key_file(public_path)?;
            match JwtConfig::rs256(&private_pem, &public_pem, &args.jwt_kid) {
                Ok(jwt) => {
                    info!(kid = %args.jwt_kid, "Signing access tokens with RS256");
                    (jwt, Some(KeySource::File(public_path.clone())))
                }
                Err(e) => {
                    error!(error = %e, "Invalid RSA key material");
                    return None;
                }
            }
        }
        None => {
            let secret = load_jwt_secret(args.jwt_secret_file.as_deref())?;
            info!("Signing access tokens with HS256");
            (JwtConfig::hs256(secret.as_bytes()), None)
        }
    };

    Some(KeyMaterial {
        jwt: jwt
            .with_issuer(args.issuer.clone())
            .with_audience(args.audience.clone()),
        public_key,
    })
}

fn read_key_file(path: &PathBuf) -> Option<Vec<u8>> {
    match std::fs::read(path) {
        Ok(content) => Some(content),
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to read key file");
            None
        }
    }
}

/// Parse and validate the public URL.
/// Returns None and logs an error if validation fails.
pub fn validate_public_url(public_url: &str) -> Option<Url> {
    let url = match Url::parse(public_url) {
        Ok(url) => url,
        Err(e) => {
            error!(url = %public_url, error = %e, "Invalid public URL");
            return None;
        }
    };

    let is_https = url.scheme() == "https";
    let is_localhost = url.host_str() == Some("localhost");

    if !is_https && !is_localhost {
        error!("public-url must use HTTPS for non-localhost deployments");
        return None;
    }

    Some(url)
}

/// Build the credential flow settings from validated arguments.
pub fn build_settings(args: &Args, public_url: &Url) -> AuthSettings {
    AuthSettings {
        access_ttl_secs: args.access_ttl_secs,
        refresh_ttl_secs: args.refresh_ttl_secs,
        lockout: LockoutPolicy {
            max_per_ip: args.max_attempts_per_ip,
            lock_ip_secs: args.lock_minutes_ip * 60,
            max_per_email: args.max_attempts_per_email,
            lock_email_secs: args.lock_minutes_email * 60,
        },
        public_url: public_url.as_str().trim_end_matches('/').to_string(),
        ..AuthSettings::default()
    }
}

/// How to read the client IP from a proxy header.
#[derive(Clone, Copy, Debug)]
pub struct IpExtractor {
    pub header_name: &'static str,
    parse: fn(&str) -> Result<String, &'static str>,
}

impl IpExtractor {
    pub fn extract(&self, header_value: &str) -> Result<String, &'static str> {
        (self.parse)(header_value)
    }
}

impl From<ClientIpHeader> for IpExtractor {
    fn from(header: ClientIpHeader) -> Self {
        match header {
            ClientIpHeader::XForwardedFor => IpExtractor {
                header_name: "x-forwarded-for",
                parse: parse_forwarded_for,
            },
            ClientIpHeader::XRealIp => IpExtractor {
                header_name: "x-real-ip",
                parse: parse_single_ip,
            },
            ClientIpHeader::CfConnectingIp => IpExtractor {
                header_name: "cf-connecting-ip",
                parse: parse_single_ip,
            },
        }
    }
}

fn parse_single_ip(value: &str) -> Result<String, &'static str> {
    value
        .trim()
        .parse::<IpAddr>()
        .map(|ip| ip.to_string())
        .map_err(|_| "IP header does not contain a valid address")
}

/// The left-most entry is the original client.
fn parse_forwarded_for(value: &str) -> Result<String, &'static str> {
    let first = value.split(',').next().unwrap_or_default();
    parse_single_ip(first)
}

/// Open the database, logging errors if it fails.
pub async fn open_database(path: &str) -> Option<Database> {
    match Database::open(path).await {
        Ok(db) => {
            info!(path = %path, "Database opened");
            Some(db)
        }
        Err(e) => {
            error!(path = %path, error = %e, "Failed to open database");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["credgate"]);
        assert_eq!(args.port, 7300);
        assert_eq!(args.jwt_kid, "primary");
        assert_eq!(args.access_ttl_secs, 900);
        assert_eq!(args.refresh_ttl_secs, 14 * 24 * 60 * 60);

        let url = validate_public_url(&args.public_url).unwrap();
        let settings = build_settings(&args, &url);
        assert_eq!(settings.lockout, LockoutPolicy::default());
        assert_eq!(settings.public_url, "http://localhost:7300");
    }

    #[test]
    fn test_lockout_settings_must_be_positive() {
        for flag in [
            "--max-attempts-per-ip",
            "--lock-minutes-ip",
            "--max-attempts-per-email",
            "--lock-minutes-email",
            "--access-ttl-secs",
            "--refresh-ttl-secs",
        ] {
            assert!(Args::try_parse_from(["credgate", flag, "0"]).is_err(), "{flag} 0");
            assert!(Args::try_parse_from(["credgate", flag, "-3"]).is_err(), "{flag} -3");
            assert!(Args::try_parse_from(["credgate", flag, "1"]).is_ok(), "{flag} 1");
        }
    }

    #[test]
    fn test_public_url_requires_https_off_localhost() {
        assert!(validate_public_url("https://auth.example.com").is_some());
        assert!(validate_public_url("http://auth.example.com").is_none());
        assert!(validate_public_url("not a url").is_none());
    }

    #[test]
    fn test_forwarded_for_takes_first_hop() {
        let extractor = IpExtractor::from(ClientIpHeader::XForwardedFor);
        assert_eq!(extractor.header_name, "x-forwarded-for");
        assert_eq!(
            extractor.extract("203.0.113.7, 10.0.0.1").unwrap(),
            "203.0.113.7"
        );
        assert!(extractor.extract("garbage").is_err());

        let real_ip = IpExtractor::from(ClientIpHeader::XRealIp);
        assert_eq!(real_ip.extract(" 2001:db8::1 ").unwrap(), "2001:db8::1");
    }
}
