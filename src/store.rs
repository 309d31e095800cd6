pub(crate) mod dao;
pub mod models;
