use anyhow::{bail, Context, Result};
use log::{info, warn};

use crate::db::DbConnection;
use crate::extract::extract_records;
use crate::settings::Settings;
use crate::upsert::{RunCounters, UpsertEngine};

/// Runs the whole migration: connect, check preconditions, extract, upsert,
/// commit. Both connections are closed on every path, including aborts.
pub async fn run(settings: &Settings, dry_run: bool) -> Result<RunCounters> {
    info!(
        "connecting to source ({}) and target ({})",
        settings.source.kind_name(),
        settings.target.kind_name()
    );
    let source = DbConnection::connect(&settings.source)
        .await
        .context("failed to connect to source database")?;
    let target = match DbConnection::connect(&settings.target)
        .await
        .context("failed to connect to target database")
    {
        Ok(t) => t,
        Err(e) => {
            source.close().await;
            return Err(e);
        }
    };

    let mut source = source;
    let mut target = target;
    let res = migrate_between(&mut source, &mut target, dry_run).await;
    source.close().await;
    target.close().await;
    res
}

/// The orchestration body, split out so tests can drive it against their
/// own connections.
pub async fn migrate_between(
    source: &mut DbConnection,
    target: &mut DbConnection,
    dry_run: bool,
) -> Result<RunCounters> {
    // a single admin must pre-exist, it becomes the owner of every
    // inserted user
    let admin_id = match target
        .fetch_optional("SELECT id FROM admins LIMIT 1", &[])
        .await
        .context("failed to look up administrator")?
    {
        Some(row) => row.get_i64(0)?,
        None => bail!("no administrator found in the target database"),
    };
    info!("using admin id {admin_id}");

    let group_id = match target.fetch_optional("SELECT id FROM groups LIMIT 1", &[]).await {
        Ok(Some(row)) => {
            let id = row.get_i64(0)?;
            info!("using group id {id}");
            Some(id)
        }
        Ok(None) => {
            warn!("no group found, users will be created without a group");
            None
        }
        Err(e) => {
            warn!("group lookup failed ({e:#}), users will be created without a group");
            None
        }
    };

    let records = extract_records(source).await?;

    if dry_run {
        info!("dry run: no writes will be issued");
    } else {
        target
            .begin()
            .await
            .context("failed to open target transaction")?;
    }

    let mut engine = UpsertEngine::new(target, admin_id, group_id, dry_run);
    for record in &records {
        engine.process(record).await;
    }
    let counters = engine.counters;
    drop(engine);

    if !dry_run {
        target
            .commit()
            .await
            .context("failed to commit target changes")?;
    }

    Ok(counters)
}
