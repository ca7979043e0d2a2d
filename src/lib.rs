pub mod arg_parser;
pub mod attribution;
pub mod collaborators;
pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod errors;
pub mod idle_tracker;
pub mod logger;
pub mod senders;
pub mod snapshot;
pub mod watcher;
