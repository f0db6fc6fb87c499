pub mod address;
pub mod app;
pub mod cli;
pub mod config;
pub mod geolocate;
pub mod optin;
pub mod reconcile;
pub mod session;
pub mod store;
pub mod util;
