use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Connection, SqliteConnection};

use xui_migrate::credentials::{is_valid_uuid, SECRET_LEN, SS_METHOD, VLESS_FLOW};
use xui_migrate::db::{DbConnection, SqlValue};
use xui_migrate::extract::extract_records;
use xui_migrate::migrate::migrate_between;
use xui_migrate::model::{ProxySettings, BYTES_PER_GB};

async fn memory_db() -> DbConnection {
    let opts = SqliteConnectOptions::new().in_memory(true);
    DbConnection::Sqlite(SqliteConnection::connect_with(&opts).await.unwrap())
}

async fn source_db() -> DbConnection {
    let mut db = memory_db().await;
    db.execute(
        "CREATE TABLE inbounds (id INTEGER PRIMARY KEY, settings TEXT)",
        &[],
    )
    .await
    .unwrap();
    db.execute(
        "CREATE TABLE client_traffics (id INTEGER PRIMARY KEY AUTOINCREMENT, \
         inbound_id INTEGER, email TEXT, up INTEGER, down INTEGER, \
         expiry_time INTEGER, total INTEGER)",
        &[],
    )
    .await
    .unwrap();
    db
}

async fn target_db(with_admin: bool, with_group: bool) -> DbConnection {
    let mut db = memory_db().await;
    db.execute(
        "CREATE TABLE admins (id INTEGER PRIMARY KEY AUTOINCREMENT, username TEXT)",
        &[],
    )
    .await
    .unwrap();
    db.execute(
        "CREATE TABLE groups (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT)",
        &[],
    )
    .await
    .unwrap();
    db.execute(
        "CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT, \
         username TEXT UNIQUE, status TEXT, used_traffic INTEGER, \
         data_limit INTEGER, created_at TEXT, edit_at TEXT, admin_id INTEGER, \
         data_limit_reset_strategy TEXT, expire TEXT, proxy_settings TEXT)",
        &[],
    )
    .await
    .unwrap();
    db.execute(
        "CREATE TABLE users_groups_association (user_id INTEGER, groups_id INTEGER, \
         PRIMARY KEY (user_id, groups_id))",
        &[],
    )
    .await
    .unwrap();
    if with_admin {
        db.execute(
            "INSERT INTO admins (username) VALUES (?)",
            &[SqlValue::from("admin")],
        )
        .await
        .unwrap();
    }
    if with_group {
        db.execute(
            "INSERT INTO groups (name) VALUES (?)",
            &[SqlValue::from("default")],
        )
        .await
        .unwrap();
    }
    db
}

async fn add_inbound(db: &mut DbConnection, id: i64, settings: &str) {
    db.execute(
        "INSERT INTO inbounds (id, settings) VALUES (?, ?)",
        &[SqlValue::from(id), SqlValue::from(settings)],
    )
    .await
    .unwrap();
}

async fn user_row(db: &mut DbConnection, email: &str) -> Option<UserRow> {
    let row = db
        .fetch_optional(
            "SELECT id, status, used_traffic, data_limit, expire, proxy_settings \
             FROM users WHERE username = ?",
            &[SqlValue::from(email)],
        )
        .await
        .unwrap()?;
    Some(UserRow {
        id: row.get_i64(0).unwrap(),
        status: row.opt_string(1).unwrap().unwrap(),
        used_traffic: row.get_i64(2).unwrap(),
        data_limit: row.opt_i64(3).unwrap(),
        expire: row.opt_string(4).unwrap(),
        proxy_settings: row.opt_string(5).unwrap().unwrap(),
    })
}

struct UserRow {
    id: i64,
    status: String,
    used_traffic: i64,
    data_limit: Option<i64>,
    expire: Option<String>,
    proxy_settings: String,
}

#[tokio::test]
async fn fresh_insert_with_defaults() {
    let mut source = source_db().await;
    let mut target = target_db(true, true).await;
    add_inbound(
        &mut source,
        1,
        r#"{"clients":[{"email":"a@x.com","id":"not-a-uuid","enable":true,"expiryTime":0,"totalGB":0}]}"#,
    )
    .await;

    let counters = migrate_between(&mut source, &mut target, false)
        .await
        .unwrap();
    assert_eq!(counters.imported, 1);
    assert_eq!(counters.total(), 1);

    let user = user_row(&mut target, "a@x.com").await.unwrap();
    assert_eq!(user.status, "active");
    assert_eq!(user.used_traffic, 0);
    assert_eq!(user.data_limit, None);
    assert_eq!(user.expire, None);

    let bundle: ProxySettings = serde_json::from_str(&user.proxy_settings).unwrap();
    let vmess_id = bundle.vmess.unwrap().id.unwrap();
    assert!(is_valid_uuid(&vmess_id));
    assert_ne!(vmess_id, "not-a-uuid");
    let vless = bundle.vless.unwrap();
    assert_eq!(vless.id.unwrap(), vmess_id);
    assert_eq!(vless.flow.as_deref(), Some(VLESS_FLOW));
    let trojan_pw = bundle.trojan.unwrap().password.unwrap();
    let ss = bundle.shadowsocks.unwrap();
    let ss_pw = ss.password.unwrap();
    assert_eq!(ss.method.as_deref(), Some(SS_METHOD));
    for pw in [&trojan_pw, &ss_pw] {
        assert_eq!(pw.len(), SECRET_LEN);
        assert!(pw.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    // group association was created for the new row
    let assoc = target
        .fetch_optional(
            "SELECT groups_id FROM users_groups_association WHERE user_id = ?",
            &[SqlValue::from(user.id)],
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(assoc.get_i64(0).unwrap(), 1);
}

#[tokio::test]
async fn valid_legacy_uuid_is_adopted_verbatim() {
    let uuid = "f47ac10b-58cc-4372-a567-0e02b2c3d479";
    let mut source = source_db().await;
    let mut target = target_db(true, false).await;
    add_inbound(
        &mut source,
        1,
        &format!(r#"{{"clients":[{{"email":"a@x.com","id":"{uuid}"}}]}}"#),
    )
    .await;

    migrate_between(&mut source, &mut target, false)
        .await
        .unwrap();
    let user = user_row(&mut target, "a@x.com").await.unwrap();
    let bundle: ProxySettings = serde_json::from_str(&user.proxy_settings).unwrap();
    assert_eq!(bundle.vmess.unwrap().id.as_deref(), Some(uuid));
}

#[tokio::test]
async fn update_rewrites_bundle_when_one_secret_is_short() {
    let good_uuid = "f47ac10b-58cc-4372-a567-0e02b2c3d479";
    let good_ss = "abcdefghijklmnopqrstuv";
    let mut source = source_db().await;
    let mut target = target_db(true, false).await;
    add_inbound(
        &mut source,
        1,
        r#"{"clients":[{"email":"a@x.com","id":"not-a-uuid"}]}"#,
    )
    .await;
    let seeded = format!(
        r#"{{"vmess":{{"id":"{good_uuid}"}},"vless":{{"id":"{good_uuid}","flow":"{VLESS_FLOW}"}},"trojan":{{"password":"short"}},"shadowsocks":{{"password":"{good_ss}","method":"{SS_METHOD}"}}}}"#
    );
    target
        .execute(
            "INSERT INTO users (username, status, used_traffic, admin_id, proxy_settings) \
             VALUES (?, ?, ?, ?, ?)",
            &[
                SqlValue::from("a@x.com"),
                SqlValue::from("disabled"),
                SqlValue::from(999i64),
                SqlValue::from(1i64),
                SqlValue::from(seeded),
            ],
        )
        .await
        .unwrap();

    let counters = migrate_between(&mut source, &mut target, false)
        .await
        .unwrap();
    assert_eq!(counters.updated, 1);
    assert_eq!(counters.imported, 0);

    let user = user_row(&mut target, "a@x.com").await.unwrap();
    assert_eq!(user.status, "active");
    assert_eq!(user.used_traffic, 0);

    let bundle: ProxySettings = serde_json::from_str(&user.proxy_settings).unwrap();
    // the still-valid values survive the wholesale rewrite
    assert_eq!(bundle.vmess.unwrap().id.as_deref(), Some(good_uuid));
    assert_eq!(
        bundle.shadowsocks.unwrap().password.as_deref(),
        Some(good_ss)
    );
    // the short trojan password was regenerated
    let trojan_pw = bundle.trojan.unwrap().password.unwrap();
    assert_eq!(trojan_pw.len(), SECRET_LEN);
    assert_ne!(trojan_pw, "short");
}

#[tokio::test]
async fn untouched_bundle_is_preserved_byte_for_byte() {
    let good_uuid = "f47ac10b-58cc-4372-a567-0e02b2c3d479";
    let mut source = source_db().await;
    let mut target = target_db(true, false).await;
    // legacy id matches the stored bundle, both secrets are long enough,
    // and the bundle carries an extra key the tool knows nothing about
    add_inbound(
        &mut source,
        1,
        &format!(r#"{{"clients":[{{"email":"a@x.com","id":"{good_uuid}"}}]}}"#),
    )
    .await;
    let seeded = format!(
        r#"{{"vmess":{{"id":"{good_uuid}"}},"vless":{{"id":"{good_uuid}"}},"trojan":{{"password":"0123456789abcdefghijkl"}},"shadowsocks":{{"password":"0123456789abcdefghijkl"}},"wireguard":{{"key":"keep-me"}}}}"#
    );
    target
        .execute(
            "INSERT INTO users (username, admin_id, proxy_settings) VALUES (?, ?, ?)",
            &[
                SqlValue::from("a@x.com"),
                SqlValue::from(1i64),
                SqlValue::from(seeded.clone()),
            ],
        )
        .await
        .unwrap();

    migrate_between(&mut source, &mut target, false)
        .await
        .unwrap();
    let user = user_row(&mut target, "a@x.com").await.unwrap();
    assert_eq!(user.proxy_settings, seeded);
}

#[tokio::test]
async fn empty_email_is_skipped_without_writes() {
    let mut source = source_db().await;
    let mut target = target_db(true, false).await;
    add_inbound(&mut source, 1, r#"{"clients":[{"email":"","id":"x"}]}"#).await;

    let counters = migrate_between(&mut source, &mut target, false)
        .await
        .unwrap();
    assert_eq!(counters.skipped, 1);
    assert_eq!(counters.imported + counters.updated + counters.errors, 0);

    let count = target
        .fetch_optional("SELECT COUNT(*) FROM users", &[])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(count.get_i64(0).unwrap(), 0);
}

#[tokio::test]
async fn second_run_updates_instead_of_importing() {
    let mut source = source_db().await;
    let mut target = target_db(true, true).await;
    add_inbound(
        &mut source,
        1,
        r#"{"clients":[{"email":"a@x.com","id":"not-a-uuid","expiryTime":1735689600,"totalGB":2},{"email":"b@x.com","id":""}]}"#,
    )
    .await;

    let first = migrate_between(&mut source, &mut target, false)
        .await
        .unwrap();
    assert_eq!(first.imported, 2);

    let a1 = user_row(&mut target, "a@x.com").await.unwrap();
    let b1 = user_row(&mut target, "b@x.com").await.unwrap();

    let second = migrate_between(&mut source, &mut target, false)
        .await
        .unwrap();
    assert_eq!(second.imported, 0);
    assert_eq!(second.updated, 2);
    assert_eq!(second.errors, 0);

    // everything but the migration-run timestamps is stable across reruns
    let a2 = user_row(&mut target, "a@x.com").await.unwrap();
    let b2 = user_row(&mut target, "b@x.com").await.unwrap();
    for (before, after) in [(&a1, &a2), (&b1, &b2)] {
        assert_eq!(before.status, after.status);
        assert_eq!(before.used_traffic, after.used_traffic);
        assert_eq!(before.data_limit, after.data_limit);
        assert_eq!(before.expire, after.expire);
        assert_eq!(before.proxy_settings, after.proxy_settings);
    }
}

#[tokio::test]
async fn traffic_rows_override_inline_values() {
    let mut source = source_db().await;
    add_inbound(
        &mut source,
        1,
        r#"{"clients":[{"email":"a@x.com","id":"x","expiryTime":1111,"totalGB":5}]}"#,
    )
    .await;
    source
        .execute(
            "INSERT INTO client_traffics (inbound_id, email, up, down, expiry_time, total) \
             VALUES (?, ?, ?, ?, ?, ?)",
            &[
                SqlValue::from(1i64),
                SqlValue::from("a@x.com"),
                SqlValue::from(10i64),
                SqlValue::from(20i64),
                SqlValue::from(1_735_689_600_000i64),
                SqlValue::from(2 * BYTES_PER_GB),
            ],
        )
        .await
        .unwrap();

    let records = extract_records(&mut source).await.unwrap();
    assert_eq!(records.len(), 1);
    let r = &records[0];
    assert_eq!(r.up, 10);
    assert_eq!(r.down, 20);
    assert_eq!(r.used_traffic(), 30);
    // accounting table wins over the inline client values
    assert_eq!(r.expiry_time, 1_735_689_600_000);
    assert_eq!(r.total_gb, 2.0);
    assert_eq!(r.data_limit(), Some(2 * BYTES_PER_GB));
}

#[tokio::test]
async fn unmatched_clients_default_to_zero_traffic() {
    let mut source = source_db().await;
    add_inbound(
        &mut source,
        1,
        r#"{"clients":[{"email":"a@x.com","id":"x","expiryTime":1111,"totalGB":5}]}"#,
    )
    .await;

    let records = extract_records(&mut source).await.unwrap();
    let r = &records[0];
    assert_eq!(r.used_traffic(), 0);
    assert_eq!(r.expiry_time, 1111);
    assert_eq!(r.total_gb, 5.0);
}

#[tokio::test]
async fn malformed_inbound_json_skips_only_that_inbound() {
    let mut source = source_db().await;
    let mut target = target_db(true, false).await;
    add_inbound(&mut source, 1, "{not json").await;
    add_inbound(&mut source, 2, r#"{"clients":[{"email":"b@x.com","id":"x"}]}"#).await;

    let counters = migrate_between(&mut source, &mut target, false)
        .await
        .unwrap();
    assert_eq!(counters.imported, 1);
    assert!(user_row(&mut target, "b@x.com").await.is_some());
}

#[tokio::test]
async fn missing_admin_aborts_before_any_write() {
    let mut source = source_db().await;
    let mut target = target_db(false, true).await;
    add_inbound(&mut source, 1, r#"{"clients":[{"email":"a@x.com","id":"x"}]}"#).await;

    let err = migrate_between(&mut source, &mut target, false)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("administrator"));

    let count = target
        .fetch_optional("SELECT COUNT(*) FROM users", &[])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(count.get_i64(0).unwrap(), 0);
}

#[tokio::test]
async fn dry_run_counts_without_writing() {
    let mut source = source_db().await;
    let mut target = target_db(true, true).await;
    add_inbound(
        &mut source,
        1,
        r#"{"clients":[{"email":"a@x.com","id":"x"},{"email":""}]}"#,
    )
    .await;

    let counters = migrate_between(&mut source, &mut target, true)
        .await
        .unwrap();
    assert_eq!(counters.imported, 1);
    assert_eq!(counters.skipped, 1);

    let count = target
        .fetch_optional("SELECT COUNT(*) FROM users", &[])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(count.get_i64(0).unwrap(), 0);
}

#[tokio::test]
async fn disabled_client_with_quota_and_expiry() {
    let mut source = source_db().await;
    let mut target = target_db(true, false).await;
    add_inbound(
        &mut source,
        1,
        r#"{"clients":[{"email":"a@x.com","id":"x","enable":false,"expiryTime":1735689600,"totalGB":1}]}"#,
    )
    .await;

    migrate_between(&mut source, &mut target, false)
        .await
        .unwrap();
    let user = user_row(&mut target, "a@x.com").await.unwrap();
    assert_eq!(user.status, "disabled");
    assert_eq!(user.data_limit, Some(BYTES_PER_GB));
    assert!(user.expire.as_deref().unwrap().starts_with("2025-01-01"));
}
