pub mod commands;
pub mod dispatcher;
pub mod intent;
pub mod models;
pub mod pairing;
pub mod settings;
pub mod state;
