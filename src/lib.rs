//! Barter Bot — swipe-to-match item exchange over chat.

pub mod bot;
pub mod channels;
pub mod config;
pub mod dialog;
pub mod error;
pub mod model;
pub mod photos;
pub mod search;
pub mod store;
