pub mod clock;
pub mod config;
pub mod debounce;
pub mod flywheel;
pub mod messages;
pub mod motor;
pub mod physics;
pub mod runtime;
