//! Privileged detection
//!
//! Requires the platform CLI, an access token and a direct database URL.
//! Structure comes from the catalog; the CLI contributes the structured diff
//! and the generated bindings.

use super::SchemaBackend;
use crate::config::{Credentials, OperationalConfig, PrivilegedConfig};
use crate::error::AppError;
use crate::introspection::{
    connect_pool, DetectionStrategy, PostgresIntrospector, SchemaSnapshot,
};
use crate::process::{run_command, truncate_output, CommandOutput, CommandSpec};
use async_trait::async_trait;
use deadpool_postgres::Pool;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub struct PrivilegedBackend {
    pool: Pool,
    settings: PrivilegedConfig,
    project_root: PathBuf,
    project_ref: Option<String>,
    access_token: String,
}

impl PrivilegedBackend {
    /// Verify tooling, credentials and connectivity.
    pub async fn probe(
        config: &OperationalConfig,
        credentials: &Credentials,
        project_root: &Path,
    ) -> Result<Self, AppError> {
        let access_token = credentials.access_token.clone().ok_or_else(|| {
            AppError::StrategyUnavailable("SUPABASE_ACCESS_TOKEN is not set".to_string())
        })?;
        let database_url = credentials
            .database_url
            .as_deref()
            .ok_or_else(|| AppError::StrategyUnavailable("DATABASE_URL is not set".to_string()))?;

        let version = CommandSpec::new(&config.privileged.cli_program)
            .arg("--version")
            .cwd(project_root)
            .timeout(Duration::from_secs(15));
        let output = run_command(&version)
            .await
            .map_err(|e| AppError::StrategyUnavailable(format!("platform CLI: {}", e)))?;
        if !output.success() {
            return Err(AppError::StrategyUnavailable(format!(
                "`{}` exited with {}",
                version.display(),
                output.exit_code
            )));
        }
        debug!("Platform CLI version {}", output.stdout.trim());

        let pool = connect_pool(database_url)?;
        PostgresIntrospector::ping(&pool)
            .await
            .map_err(|e| AppError::StrategyUnavailable(format!("database unreachable: {}", e)))?;

        Ok(Self {
            pool,
            settings: config.privileged.clone(),
            project_root: project_root.to_path_buf(),
            project_ref: config.project.project_ref.clone(),
            access_token,
        })
    }

    fn cli<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new(&self.settings.cli_program)
            .args(args)
            .cwd(&self.project_root)
            .env("SUPABASE_ACCESS_TOKEN", &self.access_token)
            .timeout(Duration::from_secs(self.settings.timeout_secs))
    }

    async fn run_cli(&self, spec: CommandSpec) -> Result<CommandOutput, AppError> {
        let output = run_command(&spec).await?;
        if !output.success() {
            return Err(AppError::TransientDetection(format!(
                "`{}` exited with {}: {}",
                spec.display(),
                output.exit_code,
                truncate_output(output.combined().trim(), 500)
            )));
        }
        Ok(output)
    }

    fn project_args(&self) -> Vec<String> {
        match &self.project_ref {
            Some(project_ref) => vec!["--project-id".to_string(), project_ref.clone()],
            None => vec!["--linked".to_string()],
        }
    }
}

#[async_trait]
impl SchemaBackend for PrivilegedBackend {
    fn strategy(&self) -> DetectionStrategy {
        DetectionStrategy::Privileged
    }

    async fn detect(&self) -> Result<SchemaSnapshot, AppError> {
        let payload = PostgresIntrospector::introspect(&self.pool, &self.settings.schema)
            .await
            .map_err(|e| AppError::TransientDetection(e.to_string()))?;

        let diff = if self.settings.diff_enabled {
            let spec = self.cli(["db", "diff", "--linked", "--schema", self.settings.schema.as_str()]);
            match self.run_cli(spec).await {
                Ok(output) => Some(output.stdout),
                Err(e) => {
                    // Structure is already captured; only the detail is lost.
                    warn!("Schema diff unavailable this cycle: {}", e);
                    None
                }
            }
        } else {
            None
        };

        Ok(SchemaSnapshot::new(DetectionStrategy::Privileged, payload)?.with_diff(diff))
    }

    async fn regenerate_bindings(&self, _snapshot: &SchemaSnapshot) -> Result<String, AppError> {
        let mut args = vec!["gen".to_string(), "types".to_string(), "typescript".to_string()];
        args.extend(self.project_args());
        args.extend(["--schema".to_string(), self.settings.schema.clone()]);

        let output = self.run_cli(self.cli(args)).await?;
        if output.stdout.trim().is_empty() {
            return Err(AppError::Internal(
                "type generation produced no output".to_string(),
            ));
        }
        Ok(output.stdout)
    }

    async fn sync(&self) -> Result<String, AppError> {
        let spec = self.cli(["db", "pull", "--schema", self.settings.schema.as_str()]);
        let output = self.run_cli(spec).await?;
        Ok(output.combined())
    }
}
