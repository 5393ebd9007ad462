pub mod app;
pub mod cli;
pub mod components;
pub mod report;
