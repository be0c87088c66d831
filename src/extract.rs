use std::collections::HashMap;

use anyhow::{Context, Result};
use log::{info, warn};

use crate::db::DbConnection;
use crate::model::{ClientRecord, InboundSettings, BYTES_PER_GB};

struct TrafficRow {
    up: i64,
    down: i64,
    expiry_time: i64,
    total: i64,
}

/// Reads every inbound and traffic row from the source store and joins them
/// into one record per (inbound, email). The accounting table is
/// authoritative where populated: its byte counters always apply and its
/// expiry/quota override the inline client values when non-zero.
pub async fn extract_records(source: &mut DbConnection) -> Result<Vec<ClientRecord>> {
    let inbounds = source
        .fetch_all("SELECT id, settings FROM inbounds", &[])
        .await
        .context("failed to read inbounds")?;
    let traffic_rows = source
        .fetch_all(
            "SELECT inbound_id, email, up, down, expiry_time, total FROM client_traffics",
            &[],
        )
        .await
        .context("failed to read client traffic")?;

    let mut traffic: HashMap<(i64, String), TrafficRow> = HashMap::new();
    for row in &traffic_rows {
        let inbound_id = row.opt_i64(0)?.unwrap_or_default();
        let email = row.opt_string(1)?.unwrap_or_default();
        traffic.insert(
            (inbound_id, email),
            TrafficRow {
                up: row.opt_i64(2)?.unwrap_or(0),
                down: row.opt_i64(3)?.unwrap_or(0),
                expiry_time: row.opt_i64(4)?.unwrap_or(0),
                total: row.opt_i64(5)?.unwrap_or(0),
            },
        );
    }

    info!(
        "found {} inbounds and {} traffic rows",
        inbounds.len(),
        traffic.len()
    );

    let mut records = Vec::new();
    for row in &inbounds {
        let inbound_id = row.get_i64(0)?;
        let settings_json = match row.opt_string(1)? {
            Some(s) if !s.is_empty() => s,
            _ => continue,
        };
        let settings: InboundSettings = match serde_json::from_str(&settings_json) {
            Ok(s) => s,
            Err(e) => {
                warn!("skipping inbound {inbound_id}: invalid settings JSON: {e}");
                continue;
            }
        };

        for client in settings.clients {
            let mut record = ClientRecord {
                email: client.email,
                client_id: client.id,
                enabled: client.enable,
                expiry_time: client.expiry_time,
                total_gb: client.total_gb,
                up: 0,
                down: 0,
            };
            if let Some(t) = traffic.get(&(inbound_id, record.email.clone())) {
                record.up = t.up;
                record.down = t.down;
                if t.expiry_time != 0 {
                    record.expiry_time = t.expiry_time;
                }
                if t.total != 0 {
                    record.total_gb = t.total as f64 / BYTES_PER_GB as f64;
                }
            }
            records.push(record);
        }
    }

    info!("extracted {} client records", records.len());
    Ok(records)
}
