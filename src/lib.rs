pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod media;
pub mod notifications;
pub mod pipeline;
pub mod store;
pub mod web;
pub mod tasks {
    pub mod credentials;
    pub mod files;
    pub mod scheduler;
}
