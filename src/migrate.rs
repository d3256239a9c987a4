//! Helpers for bundling the crate's SQL migrations with your own.

/// Extend an `sqlx::migrate!()` call with the `durable_jobs` table migrations.
pub trait IncludeMigrations {
    /// Append the durable job migrations to the current migrator.
    fn include_durable_job_migrations(&mut self) -> &mut Self;
}

impl IncludeMigrations for sqlx::migrate::Migrator {
    fn include_durable_job_migrations(&mut self) -> &mut Self {
        let mut migrations = self.migrations.to_vec();
        for migration in sqlx::migrate!().migrations.iter() {
            if !migrations.iter().any(|m| m.version == migration.version) {
                migrations.push(migration.clone());
            }
        }
        migrations.sort_by_key(|m| m.version);
        self.migrations = std::borrow::Cow::Owned(migrations);

        self
    }
}
