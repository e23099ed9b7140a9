pub mod configuration;
pub mod errors;
pub mod media;
pub mod model;
pub mod models;
pub mod notifier;
pub mod routes;
pub mod services;
pub mod startup;
pub mod store;
pub mod telemetry;
pub mod utils;

#[cfg(test)]
mod test_support;
