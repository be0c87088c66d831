use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Legacy 3x-ui database to read accounts from
    pub source: DbSettings,

    /// Pasarguard database to write accounts into
    pub target: DbSettings,
}

/// Connection parameters for one of the supported backends.
///
/// ```yaml
/// source:
///   kind: sqlite
///   path: /etc/x-ui/x-ui.db
/// target:
///   kind: postgres
///   host: localhost
///   database: pasarguard
///   user: postgres
///   password: secret
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DbSettings {
    Sqlite {
        /// Path to the database file
        path: String,
    },
    Postgres {
        host: String,
        #[serde(default = "default_postgres_port")]
        port: u16,
        database: String,
        user: String,
        #[serde(default)]
        password: String,
    },
    Mysql {
        host: String,
        #[serde(default = "default_mysql_port")]
        port: u16,
        database: String,
        user: String,
        #[serde(default)]
        password: String,
    },
}

impl DbSettings {
    pub fn kind_name(&self) -> &'static str {
        match self {
            DbSettings::Sqlite { .. } => "sqlite",
            DbSettings::Postgres { .. } => "postgres",
            DbSettings::Mysql { .. } => "mysql",
        }
    }
}

fn default_postgres_port() -> u16 {
    5432
}

fn default_mysql_port() -> u16 {
    3306
}
