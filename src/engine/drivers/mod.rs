// Database drivers

pub mod couchbase;
pub mod mysql;
pub mod postgres;
pub mod sqlserver;
