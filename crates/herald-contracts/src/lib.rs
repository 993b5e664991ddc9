pub mod commands;
pub mod events;
pub mod links;
pub mod presence;
