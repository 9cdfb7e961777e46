use anyhow::{bail, Result};
use tokio::process::Command;
use tracing::debug;

/// Migration runner for goose-compatible databases.
///
/// Spawns the goose binary as a subprocess; any database goose supports works
/// by passing the matching driver name and DSN.
pub struct MigrationRunner {
    goose_binary_path: String,
    migrations_dir: String,
    driver: String,
    dsn: String,
}

impl MigrationRunner {
    pub fn new(
        goose_binary_path: String,
        migrations_dir: String,
        driver: String,
        dsn: String,
    ) -> Self {
        Self {
            goose_binary_path,
            migrations_dir,
            driver,
            dsn,
        }
    }

    /// Apply all pending migrations (`goose ... up`).
    pub async fn run_migrations(&self) -> Result<()> {
        debug!(dir = %self.migrations_dir, "running migrations");
        let output = self.goose(&["up"]).await?;
        debug!("migrations completed:\n{output}");
        Ok(())
    }

    /// Roll back the most recent migration (`goose ... down`).
    pub async fn rollback_migration(&self) -> Result<()> {
        debug!("rolling back most recent migration");
        let output = self.goose(&["down"]).await?;
        debug!("rollback completed:\n{output}");
        Ok(())
    }

    /// Current migration status (`goose ... status`).
    pub async fn migration_status(&self) -> Result<String> {
        self.goose(&["status"]).await
    }

    async fn goose(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.goose_binary_path)
            .arg("-dir")
            .arg(&self.migrations_dir)
            .arg(&self.driver)
            .arg(&self.dsn)
            .args(args)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            bail!(
                "goose {} failed.\nstdout: {stdout}\nstderr: {stderr}",
                args.join(" ")
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}
