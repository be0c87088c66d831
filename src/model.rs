use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Epoch values above this are milliseconds, not seconds.
pub const MS_EPOCH_THRESHOLD: i64 = 10_000_000_000;

pub const BYTES_PER_GB: i64 = 1 << 30;

/// Parsed `settings` blob of a 3x-ui inbound row.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundSettings {
    #[serde(default)]
    pub clients: Vec<InboundClient>,
}

/// One client entry inside an inbound's settings JSON. All fields are
/// optional in the wild, `enable` defaults to true like the panel does.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundClient {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_enable")]
    pub enable: bool,
    #[serde(default, rename = "expiryTime")]
    pub expiry_time: i64,
    #[serde(default, rename = "totalGB")]
    pub total_gb: f64,
}

fn default_enable() -> bool {
    true
}

/// One account reconstructed from an inbound client entry joined with its
/// traffic accounting row. Keyed by email in the target store.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub email: String,
    pub client_id: String,
    pub enabled: bool,
    /// Epoch expiry in seconds or milliseconds, 0 means never expires
    pub expiry_time: i64,
    /// Quota in gigabytes, 0 means unlimited
    pub total_gb: f64,
    pub up: i64,
    pub down: i64,
}

impl ClientRecord {
    pub fn status(&self) -> &'static str {
        if self.enabled {
            "active"
        } else {
            "disabled"
        }
    }

    pub fn used_traffic(&self) -> i64 {
        self.up + self.down
    }

    /// Quota in bytes, None when unlimited.
    pub fn data_limit(&self) -> Option<i64> {
        if self.total_gb > 0.0 {
            Some((self.total_gb * BYTES_PER_GB as f64) as i64)
        } else {
            None
        }
    }

    pub fn expire(&self) -> Option<NaiveDateTime> {
        normalize_expiry(self.expiry_time)
    }
}

/// Converts a legacy epoch expiry into an absolute timestamp. Values above
/// [MS_EPOCH_THRESHOLD] are milliseconds and get divided down to seconds
/// first; 0 or negative means the account never expires.
pub fn normalize_expiry(expiry_time: i64) -> Option<NaiveDateTime> {
    if expiry_time <= 0 {
        return None;
    }
    let secs = if expiry_time > MS_EPOCH_THRESHOLD {
        expiry_time / 1000
    } else {
        expiry_time
    };
    DateTime::from_timestamp(secs, 0).map(|dt| dt.naive_utc())
}

/// Per-protocol credential bundle stored in `users.proxy_settings`.
///
/// Field order matters: Pasarguard expects vmess first, and serde_json
/// writes struct fields in declaration order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxySettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vmess: Option<VmessSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vless: Option<VlessSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trojan: Option<TrojanSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shadowsocks: Option<ShadowsocksSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmessSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VlessSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrojanSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowsocksSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}
