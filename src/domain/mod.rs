pub mod decode;
pub mod events;
pub mod models;
pub mod profile;
pub mod settings;
