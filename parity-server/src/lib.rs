pub mod clients;
pub mod config;
pub mod keystore;
pub mod repositories;
pub mod routes;
pub mod services;
pub mod workers;
