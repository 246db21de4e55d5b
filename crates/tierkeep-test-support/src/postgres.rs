//! Disposable Postgres databases for store integration tests.
//!
//! An external server named by `TIERKEEP_TEST_DATABASE_URL` is preferred; otherwise
//! local `initdb`/`postgres`/`pg_isready` binaries spawn a throwaway cluster.

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::str::FromStr;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow, bail};
use postgres::NoTls;
use tempfile::TempDir;
use url::Url;

/// Environment variable naming an existing server to create test databases on.
pub const TEST_DATABASE_URL_ENV: &str = "TIERKEEP_TEST_DATABASE_URL";

/// Handle to a disposable database; dropping it removes the database and any spawned server.
pub struct TestDatabase {
    connection_string: String,
    admin_url: String,
    database: String,
    server: Option<LocalServer>,
}

struct LocalServer {
    process: Child,
    _data_dir: TempDir,
}

impl TestDatabase {
    /// Connection string that can be passed to `sqlx` or other Postgres clients.
    #[must_use]
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }
}

impl Drop for TestDatabase {
    fn drop(&mut self) {
        let _ = admin_query(
            &self.admin_url,
            format!("DROP DATABASE IF EXISTS \"{}\"", self.database),
        );
        if let Some(server) = &mut self.server {
            let _ = server.process.kill();
            let _ = server.process.wait();
        }
    }
}

/// Create a fresh database for one test.
///
/// # Errors
///
/// Returns an error when no external URL is configured and local Postgres
/// binaries are missing or fail to start; callers skip the test in that case.
pub fn start_postgres() -> Result<TestDatabase> {
    if let Ok(url) = std::env::var(TEST_DATABASE_URL_ENV) {
        return create_database_on(&url, None);
    }
    let (base_url, server) = spawn_local_server()?;
    create_database_on(&base_url, Some(server))
}

fn create_database_on(base_url: &str, server: Option<LocalServer>) -> Result<TestDatabase> {
    let parsed = Url::parse(base_url).context("invalid postgres connection url")?;
    let database = unique_database_name();

    let mut admin = parsed.clone();
    admin.set_path("/postgres");
    let mut target = parsed;
    target.set_path(&format!("/{database}"));

    admin_query(admin.as_str(), format!("CREATE DATABASE \"{database}\""))?;
    Ok(TestDatabase {
        connection_string: target.to_string(),
        admin_url: admin.to_string(),
        database,
        server,
    })
}

fn spawn_local_server() -> Result<(String, LocalServer)> {
    let initdb = resolve_binary("initdb")?;
    let postgres = resolve_binary("postgres")?;
    let pg_isready = resolve_binary("pg_isready")?;

    let data_dir = tempfile::Builder::new()
        .prefix("tierkeep-pg-")
        .tempdir()
        .context("failed to create postgres data directory")?;
    let data_path = data_dir
        .path()
        .to_str()
        .context("data dir contains non-utf8 characters")?
        .to_string();

    let status = Command::new(&initdb)
        .args(["-D", &data_path, "--username=postgres", "--auth=trust"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .context("failed to run initdb")?;
    if !status.success() {
        bail!("initdb exited with failure status");
    }

    let port = reserve_port()?;
    let process = Command::new(&postgres)
        .args(["-D", &data_path, "-p", &port.to_string(), "-h", "127.0.0.1"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("failed to start postgres process")?;
    let mut server = LocalServer {
        process,
        _data_dir: data_dir,
    };

    if let Err(err) = wait_for_ready(&pg_isready, port) {
        let _ = server.process.kill();
        let _ = server.process.wait();
        return Err(err);
    }
    Ok((
        format!("postgres://postgres@127.0.0.1:{port}/postgres"),
        server,
    ))
}

fn resolve_binary(name: &str) -> Result<PathBuf> {
    let mut search_paths: Vec<PathBuf> = std::env::var_os("PATH")
        .map_or_else(Vec::new, |paths| std::env::split_paths(&paths).collect());
    search_paths.extend(
        ["/usr/lib/postgresql/16/bin", "/usr/local/bin", "/opt/homebrew/bin"]
            .into_iter()
            .map(PathBuf::from),
    );
    search_paths
        .into_iter()
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.exists())
        .ok_or_else(|| anyhow!("{name} binary is required for Postgres tests"))
}

fn reserve_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").context("failed to reserve port")?;
    Ok(listener
        .local_addr()
        .context("failed to read listener address")?
        .port())
}

fn wait_for_ready(pg_isready: &Path, port: u16) -> Result<()> {
    for _ in 0..30 {
        let ready = Command::new(pg_isready)
            .args(["-h", "127.0.0.1", "-p", &port.to_string(), "-U", "postgres"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|status| status.success());
        if ready {
            return Ok(());
        }
        thread::sleep(Duration::from_millis(200));
    }
    bail!("postgres process did not become ready in time")
}

// The synchronous client spins up its own runtime, so it runs off the caller's thread.
fn admin_query(admin_url: &str, sql: String) -> Result<()> {
    let admin = admin_url.to_string();
    thread::spawn(move || -> Result<()> {
        let config = postgres::Config::from_str(&admin)?;
        let mut client = config.connect(NoTls)?;
        client
            .simple_query(&sql)
            .map(|_| ())
            .with_context(|| format!("failed to run `{sql}`"))
    })
    .join()
    .unwrap_or_else(|_| Err(anyhow!("admin query thread panicked")))
}

fn unique_database_name() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("tierkeep_test_{}_{nanos}", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_names_are_valid_identifiers() {
        let name = unique_database_name();
        assert!(name.starts_with("tierkeep_test_"));
        assert!(
            name.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        );
    }

    #[test]
    fn missing_binary_is_reported() {
        let err = resolve_binary("definitely-not-a-postgres-binary");
        assert!(err.is_err());
    }
}
