pub mod credentials;
pub mod db;
pub mod extract;
pub mod migrate;
pub mod model;
pub mod settings;
pub mod upsert;
