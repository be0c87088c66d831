use anyhow::{Context, Result};
use chrono::Utc;
use log::{error, info, warn};
use uuid::Uuid;

use crate::credentials::{
    build_bundle, ensure_secret, generate_secret, is_valid_uuid, synthesize_unique_id,
};
use crate::db::{DbConnection, SqlValue};
use crate::model::{ClientRecord, ProxySettings};

/// Run-level counters. Every consumed record increments exactly one of
/// these exactly once.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunCounters {
    pub imported: u64,
    pub updated: u64,
    pub skipped: u64,
    pub errors: u64,
}

impl RunCounters {
    pub fn total(&self) -> u64 {
        self.imported + self.updated + self.skipped + self.errors
    }
}

/// Inserts or updates one target user per canonical record. Failures are
/// contained to the record being processed; nothing here aborts the run.
pub struct UpsertEngine<'a> {
    db: &'a mut DbConnection,
    admin_id: i64,
    group_id: Option<i64>,
    dry_run: bool,
    pub counters: RunCounters,
}

impl<'a> UpsertEngine<'a> {
    pub fn new(
        db: &'a mut DbConnection,
        admin_id: i64,
        group_id: Option<i64>,
        dry_run: bool,
    ) -> Self {
        UpsertEngine {
            db,
            admin_id,
            group_id,
            dry_run,
            counters: RunCounters::default(),
        }
    }

    pub async fn process(&mut self, record: &ClientRecord) {
        if record.email.is_empty() {
            self.counters.skipped += 1;
            return;
        }

        let existing = match self.lookup_user(&record.email).await {
            Ok(id) => id,
            Err(e) => {
                error!("failed to look up {}: {e:#}", record.email);
                self.counters.errors += 1;
                return;
            }
        };

        match existing {
            Some(user_id) => match self.update_user(user_id, record).await {
                Ok(()) => {
                    self.counters.updated += 1;
                    info!("updated {}", record.email);
                }
                Err(e) => {
                    error!("failed to update {}: {e:#}", record.email);
                    self.counters.errors += 1;
                }
            },
            None => match self.insert_user(record).await {
                Ok(()) => {
                    self.counters.imported += 1;
                    info!(
                        "imported {} (traffic: {})",
                        record.email,
                        record.used_traffic()
                    );
                }
                Err(e) => {
                    error!("failed to import {}: {e:#}", record.email);
                    self.counters.errors += 1;
                }
            },
        }
    }

    async fn lookup_user(&mut self, email: &str) -> Result<Option<i64>> {
        let row = self
            .db
            .fetch_optional(
                "SELECT id FROM users WHERE username = ?",
                &[SqlValue::from(email)],
            )
            .await?;
        row.map(|r| r.get_i64(0)).transpose()
    }

    async fn update_user(&mut self, user_id: i64, record: &ClientRecord) -> Result<()> {
        let raw = match self
            .db
            .fetch_optional(
                "SELECT proxy_settings FROM users WHERE id = ?",
                &[SqlValue::from(user_id)],
            )
            .await?
        {
            Some(row) => row.opt_string(0)?,
            None => None,
        };
        // an unparseable stored bundle regenerates the same as an empty one
        let existing: ProxySettings = raw
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default();

        let (unique_id, id_regenerated) = synthesize_unique_id(&record.client_id, &existing);
        let (ss_password, ss_regenerated) = ensure_secret(
            existing
                .shadowsocks
                .as_ref()
                .and_then(|s| s.password.as_deref()),
        );
        let (trojan_password, trojan_regenerated) =
            ensure_secret(existing.trojan.as_ref().and_then(|t| t.password.as_deref()));

        // bundle fields are interdependent on the uuid, so any regeneration
        // rewrites the whole bundle from the ensure-filtered values; an
        // untouched bundle is written back from its original JSON so unknown
        // sibling keys survive
        let bundle_value: serde_json::Value =
            if id_regenerated || ss_regenerated || trojan_regenerated {
                serde_json::to_value(build_bundle(&unique_id, &trojan_password, &ss_password))?
            } else {
                serde_json::from_str(raw.as_deref().unwrap_or("{}"))
                    .context("stored proxy_settings is not valid JSON")?
            };

        if self.dry_run {
            return Ok(());
        }

        // created_at is reset to the run time on purpose, matching the
        // original migration's rerun semantics
        let now = Utc::now().naive_utc();
        self.db
            .execute(
                "UPDATE users SET status = ?, used_traffic = ?, data_limit = ?, expire = ?, \
                 proxy_settings = ?, created_at = ?, edit_at = ? WHERE id = ?",
                &[
                    SqlValue::from(record.status()),
                    SqlValue::from(record.used_traffic()),
                    SqlValue::Int(record.data_limit()),
                    SqlValue::Timestamp(record.expire()),
                    SqlValue::Json(Some(bundle_value)),
                    SqlValue::from(now),
                    SqlValue::from(now),
                    SqlValue::from(user_id),
                ],
            )
            .await?;
        Ok(())
    }

    async fn insert_user(&mut self, record: &ClientRecord) -> Result<()> {
        let unique_id = if is_valid_uuid(&record.client_id) {
            record.client_id.clone()
        } else {
            Uuid::new_v4().to_string()
        };
        let ss_password = generate_secret();
        let trojan_password = generate_secret();
        let bundle = build_bundle(&unique_id, &trojan_password, &ss_password);

        if self.dry_run {
            return Ok(());
        }

        let now = Utc::now().naive_utc();
        let user_id = self
            .db
            .insert_returning_id(
                "INSERT INTO users (username, status, used_traffic, data_limit, created_at, \
                 admin_id, data_limit_reset_strategy, expire, proxy_settings) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                &[
                    SqlValue::from(record.email.as_str()),
                    SqlValue::from(record.status()),
                    SqlValue::from(record.used_traffic()),
                    SqlValue::Int(record.data_limit()),
                    SqlValue::from(now),
                    SqlValue::from(self.admin_id),
                    SqlValue::from("no_reset"),
                    SqlValue::Timestamp(record.expire()),
                    SqlValue::Json(Some(serde_json::to_value(bundle)?)),
                ],
            )
            .await?;

        // best effort, a user without a group association is still usable
        if let Some(group_id) = self.group_id {
            let sql = self
                .db
                .duplicate_safe_insert("users_groups_association", &["user_id", "groups_id"]);
            if let Err(e) = self
                .db
                .execute(&sql, &[SqlValue::from(user_id), SqlValue::from(group_id)])
                .await
            {
                warn!(
                    "could not associate {} with group {group_id}: {e:#}",
                    record.email
                );
            }
        }
        Ok(())
    }
}
