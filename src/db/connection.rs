use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use postgres_native_tls::MakeTlsConnector;
use std::time::Duration;
use tokio_postgres::config::SslMode;
use tokio_postgres::tls::MakeTlsConnect;
use tokio_postgres::{Client, NoTls, Socket};

use crate::error::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const POOL_SIZE: usize = 8;

pub fn parse_postgres_uri(uri: &str) -> Result<tokio_postgres::Config> {
    uri.parse::<tokio_postgres::Config>()
        .map_err(|e| Error::Config(format!("invalid postgres uri: {e}")))
}

/// Open a direct, non-pooled PostgreSQL connection.
///
/// The connection task is spawned onto the runtime and ends when the returned
/// client is dropped.
pub async fn create_client(uri: &str) -> Result<Client> {
    let config = parse_postgres_uri(uri)?;
    match config.get_ssl_mode() {
        SslMode::Disable => connect_with(&config, NoTls).await,
        _ => connect_with(&config, build_tls_connector()?).await,
    }
}

async fn connect_with<T>(config: &tokio_postgres::Config, tls: T) -> Result<Client>
where
    T: MakeTlsConnect<Socket>,
    T::Stream: Send + 'static,
{
    let (client, connection) = tokio::time::timeout(CONNECT_TIMEOUT, config.connect(tls))
        .await
        .map_err(|_| Error::Connection("connection timed out after 15s".into()))?
        .map_err(|e| Error::Connection(format!("failed to connect to PostgreSQL: {e}")))?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::warn!(error = %e, "postgres connection error");
        }
    });
    Ok(client)
}

/// Build a lazily-connecting pool for `uri`. No connection is made until the
/// first checkout.
pub fn create_pool(uri: &str) -> Result<Pool> {
    let pg_config = parse_postgres_uri(uri)?;
    let mut mgr_config = ManagerConfig::default();
    mgr_config.recycling_method = RecyclingMethod::Fast;

    let manager = match pg_config.get_ssl_mode() {
        SslMode::Disable => Manager::from_config(pg_config, NoTls, mgr_config),
        _ => Manager::from_config(pg_config, build_tls_connector()?, mgr_config),
    };

    Pool::builder(manager)
        .max_size(POOL_SIZE)
        .build()
        .map_err(|e| Error::Config(format!("postgres pool: {e}")))
}

/// TLS for `sslmode=prefer|require`. Like libpq, these modes encrypt without
/// verifying the server certificate.
fn build_tls_connector() -> Result<MakeTlsConnector> {
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .map_err(|e| Error::Config(format!("failed to build TLS connector: {e}")))?;
    Ok(MakeTlsConnector::new(connector))
}

pub fn create_mysql_pool(uri: &str) -> Result<mysql_async::Pool> {
    let opts = mysql_async::Opts::from_url(uri)
        .map_err(|e| Error::Config(format!("invalid mysql uri: {e}")))?;
    Ok(mysql_async::Pool::new(opts))
}

/// Replace the database path component of a URL-style connection URI.
pub fn with_database(uri: &str, database: &str) -> Result<String> {
    let mut url = reqwest::Url::parse(uri)
        .map_err(|e| Error::Config(format!("invalid server uri: {e}")))?;
    url.set_path(&format!("/{database}"));
    Ok(url.to_string())
}

/// Quote a PostgreSQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_database_replaces_path() {
        assert_eq!(
            with_database("postgres://postgres:pw@localhost:5432/postgres", "dbprobe_managed_ab").unwrap(),
            "postgres://postgres:pw@localhost:5432/dbprobe_managed_ab"
        );
        assert_eq!(
            with_database("mysql://root@localhost:3306", "m_1").unwrap(),
            "mysql://root@localhost:3306/m_1"
        );
        assert_eq!(
            with_database("postgres://localhost/postgres?sslmode=disable", "x").unwrap(),
            "postgres://localhost/x?sslmode=disable"
        );
    }

    #[test]
    fn test_with_database_rejects_keyword_dsn() {
        assert!(with_database("host=localhost dbname=postgres", "x").is_err());
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_create_pool_is_lazy() {
        // Nothing listens here; building the pool must not connect.
        let pool = create_pool("postgres://postgres@127.0.0.1:1/postgres?sslmode=disable").unwrap();
        assert_eq!(pool.status().size, 0);
    }

    #[test]
    fn test_invalid_uri() {
        assert!(matches!(create_pool("not a uri ::"), Err(Error::Config(_))));
    }
}
