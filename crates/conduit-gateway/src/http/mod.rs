pub mod cancel;
pub mod chat;
pub mod events;
pub mod health;
pub mod permissions;
pub mod queue;
pub mod scheduler;
pub mod status;
pub mod stream;
