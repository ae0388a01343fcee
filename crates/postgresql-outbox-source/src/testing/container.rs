//! Docker container management for PostgreSQL testing

use anyhow::{Context, Result};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Configuration for a test PostgreSQL container
pub struct PostgresContainer {
    pub container_name: String,
    pub host_port: u16,
    pub image_name: String,
    /// key=value connection string for the container
    pub connection_string: String,
}

impl PostgresContainer {
    pub fn new(container_name: &str, host_port: u16) -> Self {
        Self {
            container_name: container_name.to_string(),
            host_port,
            image_name: "postgres:16".to_string(),
            connection_string: format!(
                "host=127.0.0.1 port={host_port} user=postgres password=testpass dbname=relay"
            ),
        }
    }

    /// Starts the PostgreSQL container, replacing any leftover one with the same name
    pub fn start(&self) -> Result<()> {
        info!("Starting PostgreSQL container: {}", self.container_name);

        for action in ["stop", "rm"] {
            let _ = Command::new("docker")
                .args([action, &self.container_name])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
        }

        let output = Command::new("docker")
            .args([
                "run",
                "--name",
                &self.container_name,
                "-e",
                "POSTGRES_PASSWORD=testpass",
                "-e",
                "POSTGRES_DB=relay",
                "-p",
                &format!("{}:5432", self.host_port),
                "-d",
                &self.image_name,
            ])
            .output()
            .context("Failed to start Docker container")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Failed to start container: {stderr}");
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!("Started container: {}", container_id);
        Ok(())
    }

    /// Waits for PostgreSQL to be ready to accept connections
    pub async fn wait_until_ready(&self, timeout_secs: u64) -> Result<()> {
        info!("Waiting for PostgreSQL to be ready...");

        let start = Instant::now();
        let timeout = Duration::from_secs(timeout_secs);

        while start.elapsed() < timeout {
            match crate::client::connect(&self.connection_string).await {
                Ok(client) => {
                    if client.simple_query("SELECT 1").await.is_ok() {
                        info!("PostgreSQL is ready!");
                        return Ok(());
                    }
                }
                Err(e) => debug!("Connection attempt failed: {}", e),
            }
            tokio::time::sleep(Duration::from_millis(1000)).await;
        }

        anyhow::bail!("PostgreSQL did not become ready within {timeout_secs} seconds")
    }

    /// Stops and removes the container
    pub fn stop(&self) -> Result<()> {
        info!("Stopping container: {}", self.container_name);

        for action in ["stop", "rm"] {
            let output = Command::new("docker")
                .args([action, &self.container_name])
                .output()
                .with_context(|| format!("Failed to {action} container"))?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                debug!("docker {action} failed (container may not exist): {}", stderr);
            }
        }

        info!("Container stopped and removed");
        Ok(())
    }
}

impl Drop for PostgresContainer {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
