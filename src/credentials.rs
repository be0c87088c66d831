use rand::distributions::Alphanumeric;
use rand::Rng;
use uuid::Uuid;

use crate::model::{
    ProxySettings, ShadowsocksSettings, TrojanSettings, VlessSettings, VmessSettings,
};

pub const VLESS_FLOW: &str = "xtls-rprx-vision";
pub const SS_METHOD: &str = "chacha20-ietf-poly1305";

/// Minimum length Pasarguard accepts for trojan/shadowsocks passwords.
pub const SECRET_LEN: usize = 22;

pub fn is_valid_uuid(value: &str) -> bool {
    !value.is_empty() && Uuid::parse_str(value).is_ok()
}

/// 22 alphanumeric chars from the thread rng (a CSPRNG).
pub fn generate_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SECRET_LEN)
        .map(char::from)
        .collect()
}

/// Picks the UUID shared by the vmess and vless entries. A valid legacy id
/// wins; otherwise a valid id already in the bundle is reused (vmess first,
/// then vless); otherwise a fresh v4. The second return is true whenever the
/// result was not taken verbatim from the legacy id, which forces a bundle
/// rebuild upstream.
pub fn synthesize_unique_id(legacy_id: &str, existing: &ProxySettings) -> (String, bool) {
    if is_valid_uuid(legacy_id) {
        return (legacy_id.to_string(), false);
    }
    if let Some(id) = existing
        .vmess
        .as_ref()
        .and_then(|v| v.id.as_deref())
        .filter(|id| is_valid_uuid(id))
    {
        return (id.to_string(), true);
    }
    if let Some(id) = existing
        .vless
        .as_ref()
        .and_then(|v| v.id.as_deref())
        .filter(|id| is_valid_uuid(id))
    {
        return (id.to_string(), true);
    }
    (Uuid::new_v4().to_string(), true)
}

/// Keeps a secret that is already long enough, regenerates anything else.
pub fn ensure_secret(existing: Option<&str>) -> (String, bool) {
    match existing {
        Some(s) if s.len() >= SECRET_LEN => (s.to_string(), false),
        _ => (generate_secret(), true),
    }
}

/// Assembles the four-entry bundle in the order Pasarguard expects:
/// vmess, vless, trojan, shadowsocks.
pub fn build_bundle(unique_id: &str, trojan_password: &str, ss_password: &str) -> ProxySettings {
    ProxySettings {
        vmess: Some(VmessSettings {
            id: Some(unique_id.to_string()),
        }),
        vless: Some(VlessSettings {
            id: Some(unique_id.to_string()),
            flow: Some(VLESS_FLOW.to_string()),
        }),
        trojan: Some(TrojanSettings {
            password: Some(trojan_password.to_string()),
        }),
        shadowsocks: Some(ShadowsocksSettings {
            password: Some(ss_password.to_string()),
            method: Some(SS_METHOD.to_string()),
        }),
    }
}
